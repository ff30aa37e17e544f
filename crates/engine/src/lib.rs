// slicesync-engine: versioned viewer state and multi-participant sync.

pub mod config;
pub mod conflict;
pub mod events;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transport;
