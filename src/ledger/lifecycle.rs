use std::sync::Arc;

use tracing::info;

use crate::error::{LedgerError, Result, TraceError};
use crate::keys::{BottleKey, Stage};
use super::client::LedgerClient;
use super::{LedgerCall, LifecycleState, RevertReason, TxReceipt, TxStatus};

/// Stage transitions of the per-bottle state machine held by the ledger.
///
/// The predecessor check happens inside the ledger call itself, so a
/// transition is check-and-set in one step.
#[derive(Clone)]
pub struct LifecycleLedger {
    client: Arc<LedgerClient>,
}

impl LifecycleLedger {
    pub fn new(client: Arc<LedgerClient>) -> Self {
        Self { client }
    }

    pub async fn produce(&self, key: &BottleKey) -> Result<TxReceipt> {
        self.transition(Stage::Produce, key).await
    }

    pub async fn ship(&self, key: &BottleKey) -> Result<TxReceipt> {
        self.transition(Stage::Ship, key).await
    }

    pub async fn deliver(&self, key: &BottleKey) -> Result<TxReceipt> {
        self.transition(Stage::Deliver, key).await
    }

    pub async fn transition(&self, stage: Stage, key: &BottleKey) -> Result<TxReceipt> {
        let receipt = self.client.send(LedgerCall::transition(stage, *key)).await?;

        match &receipt.status {
            TxStatus::Success => {
                info!("⛓  {} tx = {} (block {})", stage, receipt.tx_hash, receipt.block);
                Ok(receipt)
            }
            TxStatus::Reverted(RevertReason::InvalidTransition { current }) => {
                Err(TraceError::InvalidTransition {
                    stage,
                    bottle: key.to_hex(),
                    state: *current,
                })
            }
            TxStatus::Reverted(other) => Err(TraceError::Ledger(LedgerError::Reverted {
                call: stage.to_string(),
                tx_hash: receipt.tx_hash.clone(),
                reason: other.to_string(),
            })),
        }
    }

    pub async fn status(&self, key: &BottleKey) -> Result<LifecycleState> {
        Ok(self.client.status(key).await?)
    }
}
