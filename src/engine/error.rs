use crate::model::{BookingStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Unknown or inactive page slug, unknown page or booking id.
    NotFound(String),
    AlreadyExists(String),
    /// Malformed input: bad dates, missing customer fields, inverted hours.
    Validation(String),
    /// The requested window is taken. `with` names what it collided with.
    Conflict { span: Span, with: String },
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict { span, with } => write!(
                f,
                "slot [{}, {}) is no longer available: conflicts with {with}",
                span.start, span.end
            ),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
