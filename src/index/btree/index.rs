mod base;
mod delete;
mod insert;
mod iterator;

pub use base::BPlusTree;
pub use iterator::TreeIterator;
