//! Master-side pieces: the scheduler daemon wiring, the registry and
//! agent HTTP clients, and the pod status cache.

pub mod cache;
pub mod config;
pub mod registry;
