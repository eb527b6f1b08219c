#![forbid(unsafe_code)]

// Coordinator error taxonomy. Every variant maps to a stable wire code.

use crate::media::MediaError;
use crate::session::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// The referenced object exists but belongs to another client
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Cannot consume producer {0}")]
    CannotConsume(String),

    #[error("Media engine failure: {0}")]
    EngineFailure(#[from] MediaError),

    #[error("Session store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::RoomNotFound(_) => "room_not_found",
            CoordinatorError::ClientNotFound(_) => "client_not_found",
            CoordinatorError::TransportNotFound(_) => "transport_not_found",
            CoordinatorError::ProducerNotFound(_) => "producer_not_found",
            CoordinatorError::ConsumerNotFound(_) => "consumer_not_found",
            CoordinatorError::Unauthorized(_) => "unauthorized",
            CoordinatorError::CannotConsume(_) => "cannot_consume",
            CoordinatorError::EngineFailure(_) => "engine_failure",
            CoordinatorError::StoreUnavailable(_) => "store_unavailable",
            CoordinatorError::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_convert_with_stable_code() {
        let err: CoordinatorError = MediaError::ProducerError("boom".into()).into();
        assert_eq!(err.code(), "engine_failure");
        assert_eq!(err.to_string(), "Media engine failure: Producer error: boom");
        assert_eq!(CoordinatorError::Unauthorized("t1".into()).code(), "unauthorized");
    }
}
