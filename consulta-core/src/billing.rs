//! Credit balances and the transactions that move them.

/// Serialized debit, credit, and refund operations.
pub mod coordinator;
/// Billing events and the listener applying them.
pub mod events;
/// Transaction records and the in-memory ledger.
pub mod ledger;
/// Per-key FIFO locks.
pub mod locks;

pub use coordinator::*;
pub use events::*;
pub use ledger::*;
pub use locks::*;
