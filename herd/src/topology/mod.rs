//! In-memory model of the managed fleet: backends and replication groups.
//! The state store is the authority; these are the records it round-trips.

pub mod backend;
pub mod group;

pub use backend::{Backend, BackendMode, BackendStatus, Observed};
pub use group::Group;
