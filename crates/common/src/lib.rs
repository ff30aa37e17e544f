// slicesync-common: wire protocol and domain types shared across the workspace

pub mod error;
pub mod protocol;
pub mod types;
