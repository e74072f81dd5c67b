use std::fmt;

#[derive(Debug, Clone)]
pub enum LedgerError {
    Unavailable {
        operation: String,
        reason: String,
    },

    Timeout {
        operation: String,
        duration_ms: Option<u64>,
    },

    Reverted {
        call: String,
        tx_hash: String,
        reason: String,
    },

    Snapshot {
        path: String,
        reason: String,
    },
}

impl LedgerError {
    /// Whether the outcome of the call is unknown rather than known-failed.
    /// The transaction may still land; re-query before retrying a write.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, LedgerError::Unavailable { .. } | LedgerError::Timeout { .. })
    }

    pub fn suggestion(&self) -> String {
        match self {
            LedgerError::Unavailable { operation, .. } => {
                format!(
                    "Ledger unreachable during '{operation}':\n  \
                     • Check the ledger endpoint / snapshot path\n  \
                     • Re-run `winetrace reconcile` before retrying a write\n  \
                     • The transaction may still land; do not resubmit blindly"
                )
            }

            LedgerError::Timeout { operation, .. } => {
                format!(
                    "Operation '{operation}' timed out:\n  \
                     • A timeout is not proof of failure\n  \
                     • Run `winetrace reconcile` to read ledger truth\n  \
                     • Increase ledger_timeout_ms in the config"
                )
            }

            LedgerError::Reverted { call, .. } => {
                format!(
                    "The ledger reverted '{call}':\n  \
                     • A row key may already be bound to a different hash\n  \
                     • Run `winetrace verify` to inspect the anchored values"
                )
            }

            LedgerError::Snapshot { path, .. } => {
                format!(
                    "Ledger snapshot at {path} could not be used:\n  \
                     • Check file permissions\n  \
                     • Ensure the file is a valid ledger snapshot"
                )
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Unavailable { .. } => "LEDGER_UNAVAILABLE",
            LedgerError::Timeout { .. } => "LEDGER_TIMEOUT",
            LedgerError::Reverted { .. } => "TX_REVERTED",
            LedgerError::Snapshot { .. } => "SNAPSHOT_ERROR",
        }
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Unavailable { operation, reason } => {
                write!(f, "Ledger unavailable during {operation}: {reason}")
            }

            LedgerError::Timeout { operation, duration_ms } => {
                write!(f, "Timeout during {operation}")?;
                if let Some(ms) = duration_ms {
                    write!(f, " (after {}ms)", ms)?;
                }
                Ok(())
            }

            LedgerError::Reverted { call, tx_hash, reason } => {
                write!(f, "Tx reverted: {call} ({tx_hash}): {reason}")
            }

            LedgerError::Snapshot { path, reason } => {
                write!(f, "Ledger snapshot error ({path}): {reason}")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::Unavailable {
            operation: "getProof".into(),
            reason: "connection refused".into(),
        }.error_code(), "LEDGER_UNAVAILABLE");

        assert_eq!(LedgerError::Reverted {
            call: "storeHash".into(),
            tx_hash: "0x00".into(),
            reason: "bound".into(),
        }.error_code(), "TX_REVERTED");
    }

    #[test]
    fn test_indeterminate_only_for_network_failures() {
        assert!(LedgerError::Timeout { operation: "storeHash".into(), duration_ms: Some(5000) }.is_indeterminate());
        assert!(LedgerError::Unavailable { operation: "x".into(), reason: "y".into() }.is_indeterminate());
        assert!(!LedgerError::Reverted {
            call: "storeHash".into(),
            tx_hash: "0x01".into(),
            reason: "bound".into(),
        }.is_indeterminate());
    }

    #[test]
    fn test_timeout_display() {
        let err = LedgerError::Timeout { operation: "storeHash".into(), duration_ms: Some(1500) };
        assert_eq!(err.to_string(), "Timeout during storeHash (after 1500ms)");
    }
}
