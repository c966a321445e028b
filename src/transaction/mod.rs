// Transaction management module

pub mod concurrency;

// Public exports
pub use concurrency::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionAbortError,
    TransactionManager, TransactionState,
};
