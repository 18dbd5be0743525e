//! opsdeck-core library.
//!
//! Client-side synchronization core: a keyed query cache, optimistic
//! mutations with exact rollback, and live stream merging with backoff
//! reconnect.
//!
//! # Conventions
//!
//! - **Errors**: Engine operations return [`error::SyncError`]; config
//!   loading and collaborator ports use `anyhow::Result`.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod model;
pub mod mutation;
pub mod ports;
pub mod query;
pub mod stream;

pub use error::{ErrorCode, ErrorInfo, SyncError};
pub use mutation::{MutationCache, MutationDescriptor, MutationKind, MutationOutcome};
pub use query::{QueryCache, QueryEntry, QueryKey, QueryStatus};
pub use stream::{LiveStreams, StreamStatus, TotalPolicy};
