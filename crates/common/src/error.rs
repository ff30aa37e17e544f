// Protocol-level errors shared across the workspace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode sync message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode sync message: {0}")]
    Decode(#[source] serde_json::Error),
}
