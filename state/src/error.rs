//! State-layer errors.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid tracker id {0}")]
    InvalidId(i32),

    #[error("tracker id {id} exceeds the configured ceiling {ceiling}")]
    IdAboveCeiling { id: i32, ceiling: usize },

    #[error("tracker id {0} is already bound to a different object")]
    RebindMismatch(i32),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
