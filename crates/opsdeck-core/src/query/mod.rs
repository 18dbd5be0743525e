//! Query Cache: keyed snapshots of server reads.

pub mod cache;
pub mod entry;
pub mod key;

pub use cache::{CacheTxn, QueryCache, QueryCacheBuilder, Subscription};
pub use entry::{QueryEntry, QueryStatus};
pub use key::QueryKey;
