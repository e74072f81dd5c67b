mod ledger_error;

use thiserror::Error;

use crate::keys::Stage;
use crate::ledger::LifecycleState;
use crate::workflow::PartialCommit;

pub use ledger_error::LedgerError;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition: cannot {stage} {bottle} from state {state}")]
    InvalidTransition {
        stage: Stage,
        bottle: String,
        state: LifecycleState,
    },

    #[error("Anchor write error for {row_key}: {reason}")]
    AnchorWrite {
        row_key: String,
        reason: String,
    },

    #[error("Anchor unavailable: {0}")]
    AnchorUnavailable(String),

    #[error("Partial commit: {0}")]
    PartialCommit(Box<PartialCommit>),

    #[error("Canonical encoding error: {0}")]
    Canonical(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TraceError {
    /// Errors after which the same call may be attempted again.
    /// Anchor unavailability still requires a ledger re-query first.
    pub fn is_retryable(&self) -> bool {
        match self {
            TraceError::Validation(_) | TraceError::AnchorWrite { .. } | TraceError::AnchorUnavailable(_) => true,
            TraceError::Ledger(e) => e.is_indeterminate(),
            _ => false,
        }
    }

    pub fn as_partial_commit(&self) -> Option<&PartialCommit> {
        match self {
            TraceError::PartialCommit(p) => Some(p),
            _ => None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            TraceError::Ledger(e) => e.error_code(),
            TraceError::Validation(_) => "VALIDATION_ERROR",
            TraceError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TraceError::AnchorWrite { .. } => "ANCHOR_WRITE",
            TraceError::AnchorUnavailable(_) => "ANCHOR_UNAVAILABLE",
            TraceError::PartialCommit(_) => "PARTIAL_COMMIT",
            TraceError::Canonical(_) => "CANONICAL_ERROR",
            TraceError::KeyDerivation(_) => "KEY_DERIVATION",
            TraceError::Config(_) => "CONFIG_ERROR",
            TraceError::Storage(_) => "STORAGE_ERROR",
            TraceError::Io(_) => "IO_ERROR",
            TraceError::Yaml(_) => "YAML_ERROR",
            TraceError::Json(_) => "JSON_ERROR",
        }
    }

    pub fn suggestion(&self) -> Option<String> {
        match self {
            TraceError::Ledger(e) => Some(e.suggestion()),

            TraceError::InvalidTransition { stage, state, .. } => Some(format!(
                "The ledger refused '{stage}' from state {state}:\n  \
                 • Stages must run produce → ship → deliver\n  \
                 • Run `winetrace reconcile --stage {stage}` to compare local status with the ledger"
            )),

            TraceError::AnchorWrite { row_key, .. } => Some(format!(
                "The ledger will not bind {row_key} to this hash:\n  \
                 • The key is already anchored with a different value\n  \
                 • Run `winetrace diagnose` with the original submission to compare fingerprints"
            )),

            TraceError::AnchorUnavailable(_) => Some(
                "The anchor could not be confirmed:\n  \
                 • Nothing was committed locally\n  \
                 • Run `winetrace reconcile` before retrying the same call"
                    .to_string(),
            ),

            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
