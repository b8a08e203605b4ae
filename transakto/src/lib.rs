//! Client-side multi-document ACID transactions over a shard-partitioned
//! document store.
//!
//! The store offers only single-document atomicity (compare-and-swap); this
//! crate layers all-or-nothing semantics and isolation on top of it with
//! active transaction records (ATRs): per-shard documents tracking every
//! in-flight attempt, staged out-of-band document changes, and a cooperative
//! background sweep that finishes whatever a crashed coordinator left
//! behind.
//!
//! ```rust,ignore
//! let transactions = Transactions::new(store, TransactionsConfig::default());
//!
//! let result = transactions
//!     .run(|ctx| async move {
//!         let order = ctx.get("order-1").await?;
//!         ctx.replace(&order, json!({ "status": "paid" })).await?;
//!         ctx.insert("receipt-1", json!({ "order": "order-1" })).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod query;

mod atr;
mod attempt;
mod cleanup;
mod error;
mod retry;
mod shard;
mod staged;
mod topology;
mod transactions;

pub use atr::AtrState;
pub use attempt::{AttemptContext, DocumentView};
pub use config::{ConfigBuilder, QueryConfig, TransactionsConfig};
pub use error::{ErrorClass, FailureOutcome, TransactionError, TransactionFailed};
pub use query::{QueryExecutor, QueryOptions, ScanConsistency};
pub use shard::shard_of;
pub use topology::{FixedTopology, ShardOwner};
pub use transactions::{
    AbortHandle, AttemptSummary, TransactionOptions, TransactionResult, Transactions,
};
