pub mod error;
pub mod key;
pub mod node;
pub mod index;

pub use error::BTreeError;
pub use key::GenericKey;
pub use node::{BTreeNode, InternalNode, LeafNode};
pub use index::{BPlusTree, TreeIterator};
