//! Typed failures of the core operations.
//!
//! The transport layer decides how each variant is presented; the core only
//! says what went wrong.

/// Error returned by every core operation.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    /// A referenced plant or pump command does not exist.
    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Malformed request data: bad time range, unknown enum value, invalid
    /// plant envelope, non-positive amount.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation conflicts with the current state of the record.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl FarmError {
    pub fn plant_not_found(id: i64) -> Self {
        FarmError::NotFound { entity: "plant", id }
    }

    pub fn command_not_found(id: i64) -> Self {
        FarmError::NotFound { entity: "pump command", id }
    }
}

pub type FarmResult<T> = Result<T, FarmError>;
