//! Unified error types for brood

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HelperId, HelperStatus};

/// Unified error type for all brood operations
#[derive(Error, Debug)]
pub enum BroodError {
    // Spawn-time errors
    #[error("spawn depth exhausted for helper {0} (depth=0)")]
    BudgetExhausted(HelperId),

    #[error("breadth limit reached for helper {parent}: sibling index {index} >= breadth {breadth}")]
    TooManySiblings {
        parent: HelperId,
        index: u32,
        breadth: u32,
    },

    #[error("Invalid spawn budget: {0}")]
    InvalidBudget(String),

    #[error("helper identity overflow below {0}")]
    IdentityOverflow(HelperId),

    // Registry errors
    #[error("Unknown helper identity: {0}")]
    UnknownIdentity(HelperId),

    #[error("helper {identity} has live descendants: {children:?}")]
    HasDescendants {
        identity: HelperId,
        children: Vec<HelperId>,
    },

    #[error("helper {identity} is {found}, expected {expected}")]
    StateMismatch {
        identity: HelperId,
        expected: String,
        found: HelperStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Hub errors
    #[error("hub already running at {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("hub unavailable: {0}")]
    HubUnavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("hub closed the connection")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reported by the hub for a request this process sent
    #[error("{message}")]
    Hub { kind: ErrorKind, message: String },

    // Collaborator errors
    #[error("Container launch failed: {0}")]
    Launch(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("File watcher error: {0}")]
    Watch(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Stable error codes carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BudgetExhausted,
    TooManySiblings,
    InvalidBudget,
    UnknownIdentity,
    AlreadyRunning,
    HasDescendants,
    StateMismatch,
    InvalidRequest,
    Unavailable,
    Timeout,
    Protocol,
    Launch,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BudgetExhausted => "budget_exhausted",
            Self::TooManySiblings => "too_many_siblings",
            Self::InvalidBudget => "invalid_budget",
            Self::UnknownIdentity => "unknown_identity",
            Self::AlreadyRunning => "already_running",
            Self::HasDescendants => "has_descendants",
            Self::StateMismatch => "state_mismatch",
            Self::InvalidRequest => "invalid_request",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Launch => "launch",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl BroodError {
    /// Wire code for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BudgetExhausted(_) => ErrorKind::BudgetExhausted,
            Self::TooManySiblings { .. } => ErrorKind::TooManySiblings,
            Self::InvalidBudget(_) | Self::IdentityOverflow(_) => ErrorKind::InvalidBudget,
            Self::UnknownIdentity(_) => ErrorKind::UnknownIdentity,
            Self::HasDescendants { .. } => ErrorKind::HasDescendants,
            Self::StateMismatch { .. } => ErrorKind::StateMismatch,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::HubUnavailable(_) | Self::ConnectionClosed => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::Protocol,
            Self::Launch(_) => ErrorKind::Launch,
            Self::Hub { kind, .. } => *kind,
            Self::Config(_) | Self::Watch(_) | Self::Io(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::StateMismatch
        )
    }
}

/// Result type alias using BroodError
pub type Result<T> = std::result::Result<T, BroodError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            BroodError::BudgetExhausted(3).kind(),
            ErrorKind::BudgetExhausted
        );
        assert_eq!(
            BroodError::HasDescendants {
                identity: 1,
                children: vec![5],
            }
            .kind(),
            ErrorKind::HasDescendants
        );
        assert_eq!(BroodError::ConnectionClosed.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let err = BroodError::Hub {
            kind: ErrorKind::TooManySiblings,
            message: "breadth limit reached".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::TooManySiblings);
        assert_eq!(err.to_string(), "breadth limit reached");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_kind_wire_format() {
        let json = serde_json::to_string(&ErrorKind::StateMismatch).unwrap();
        assert_eq!(json, "\"state_mismatch\"");
        assert_eq!(ErrorKind::StateMismatch.to_string(), "state_mismatch");
    }
}
