//! Live Stream Merge Engine.

pub mod backoff;
pub mod connection;
pub mod engine;
pub mod merge;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionState, InvalidConnectionTransition, StreamConnection};
pub use engine::{LiveStreams, StreamStatus, StreamSubscription};
pub use merge::{EventWindow, MergeOutcome, TotalPolicy, merge_item};
