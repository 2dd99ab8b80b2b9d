//! Error types for the fairplay engine
//!
//! Validation errors (bad bets, unknown sessions, wrong state) are part of normal
//! control flow and go back to the caller. Storage and commitment failures are
//! retriable server faults: the operation left no partial state behind.

use crate::common::types::SessionStatus;
use uuid::Uuid;

/// Root error type for all engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid bet: {0}")]
    InvalidBet(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("User not found: {0}")]
    UserNotFound(Uuid),

    #[error("Username already registered: {0}")]
    UserExists(String),

    #[error("Invalid state: cannot {operation} session {session_id} while {status}")]
    InvalidState {
        session_id: Uuid,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Seed commitment failed: {0}")]
    CommitmentFailure(String),

    #[error("Ledger conflict: {0}")]
    LedgerConflict(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Configuration and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

impl EngineError {
    /// Errors the caller caused; safe to show and never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidBet(_)
                | EngineError::InsufficientBalance { .. }
                | EngineError::SessionNotFound(_)
                | EngineError::UserNotFound(_)
                | EngineError::UserExists(_)
                | EngineError::InvalidState { .. }
                | EngineError::InvalidAction(_)
        )
    }

    /// Server-side faults after which the same request may be sent again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            EngineError::CommitmentFailure(_)
                | EngineError::LedgerConflict(_)
                | EngineError::PersistenceFailure(_)
        )
    }

    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidBet(_) => "INVALID_BET",
            EngineError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            EngineError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            EngineError::UserNotFound(_) => "USER_NOT_FOUND",
            EngineError::UserExists(_) => "USER_EXISTS",
            EngineError::InvalidState { .. } => "INVALID_STATE",
            EngineError::InvalidAction(_) => "INVALID_ACTION",
            EngineError::CommitmentFailure(_) => "COMMITMENT_FAILURE",
            EngineError::LedgerConflict(_) => "LEDGER_CONFLICT",
            EngineError::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            EngineError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

// External error conversions
impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::PersistenceFailure(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::PersistenceFailure(format!("Corrupted record: {}", e))
    }
}

// Convenience type alias for Results
pub type EngineResult<T> = Result<T, EngineError>;
