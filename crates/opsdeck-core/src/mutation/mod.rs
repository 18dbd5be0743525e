//! Optimistic Mutation Cache.

pub mod cache;
pub mod descriptor;
pub mod patch;
pub mod pending;

pub use cache::{MutationCache, MutationOutcome};
pub use descriptor::{MutationDescriptor, MutationKind, Patch, Targets};
pub use patch::PatchEffect;
pub use pending::{InvalidTransition, MutationState, PendingMutation, Reservation, Reservations};
