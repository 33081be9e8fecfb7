use crate::model::{ShiftId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid range: start {start} must be before end {end}")]
    InvalidRange { start: i64, end: i64 },
    #[error("invalid device: {0}")]
    InvalidDevice(String),
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("shift not found: {0}")]
    NotFound(ShiftId),
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("invalid user: {0:?}")]
    InvalidUser(UserId),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("identity provider unavailable: {0}")]
    IdentityUnavailable(String),
}

impl EngineError {
    /// Caller-side mistakes, as opposed to consistency or infrastructure failures.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            EngineError::UnknownUser(_) | EngineError::Storage(_) | EngineError::IdentityUnavailable(_)
        )
    }
}
