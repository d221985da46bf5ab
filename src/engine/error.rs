use ulid::Ulid;

use crate::model::{BookingStatus, MalformedSpan, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The candidate overlaps this active booking.
    Conflict { booking_id: Ulid, span: Span },
    /// The candidate overlaps this downtime.
    AssetDown(Ulid),
    InvalidSpan(MalformedSpan),
    /// The booking is in a state that doesn't allow the operation.
    InvalidState { id: Ulid, status: BookingStatus },
    Forbidden(&'static str),
    UnknownActor(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { booking_id, span } => write!(
                f,
                "conflict with booking {booking_id} [{}, {})",
                span.start, span.end
            ),
            EngineError::AssetDown(id) => write!(f, "asset unavailable during downtime: {id}"),
            EngineError::InvalidSpan(e) => write!(f, "invalid interval: {e}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} is {}", status.as_str())
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::UnknownActor(id) => write!(f, "unknown user: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<MalformedSpan> for EngineError {
    fn from(e: MalformedSpan) -> Self {
        EngineError::InvalidSpan(e)
    }
}
