use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::keys::{BottleKey, RowKey};
use super::{ContentHash, Ledger, LedgerCall, LifecycleState, TxReceipt};

/// Sequenced access to a [`Ledger`] for one sending account.
///
/// The client owns the sender's nonce. Sends are serialized through it, and a
/// send whose outcome is unknown drops the cached nonce so the next send
/// re-reads it from the ledger.
pub struct LedgerClient {
    ledger: Arc<dyn Ledger>,
    nonce: Mutex<Option<u64>>,
    timeout: Duration,
}

impl LedgerClient {
    pub fn new(ledger: Arc<dyn Ledger>, timeout: Duration) -> Self {
        Self {
            ledger,
            nonce: Mutex::new(None),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn send(&self, call: LedgerCall) -> Result<TxReceipt, LedgerError> {
        let mut nonce_guard = self.nonce.lock().await;

        let nonce = match *nonce_guard {
            Some(n) => n,
            None => self.bounded("getTransactionCount", self.ledger.transaction_count()).await?,
        };

        debug!("submitting {} for {} with nonce {}", call.name(), call.target_hex(), nonce);

        match self.bounded(call.name(), self.ledger.submit(call.clone(), nonce)).await {
            Ok(receipt) => {
                *nonce_guard = Some(nonce + 1);
                Ok(receipt)
            }
            Err(e) => {
                warn!("{} for {} failed: {}", call.name(), call.target_hex(), e);
                *nonce_guard = None;
                Err(e)
            }
        }
    }

    pub async fn get_proof(&self, key: &RowKey) -> Result<Option<ContentHash>, LedgerError> {
        self.bounded("getProof", self.ledger.get_proof(key)).await
    }

    pub async fn status(&self, key: &BottleKey) -> Result<LifecycleState, LedgerError> {
        self.bounded("status", self.ledger.status(key)).await
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout {
                operation: operation.to_string(),
                duration_ms: Some(self.timeout.as_millis() as u64),
            }),
        }
    }
}
