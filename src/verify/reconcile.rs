use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::keys::{bottle_key, row_key, RowKey, Stage};
use crate::ledger::{ContentHash, HashAnchor, LedgerClient, LifecycleLedger, LifecycleState};
use crate::store::RecordStore;
use crate::workflow::PartialCommit;
use super::local_stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    Consistent,
    /// The ledger holds an anchor or lifecycle state the store does not.
    LedgerAhead,
    /// The store holds a row or status the ledger never recorded.
    LocalAhead,
    /// Both sides hold a value for the key and they differ.
    Conflict,
}

impl Reconciliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reconciliation::Consistent => "consistent",
            Reconciliation::LedgerAhead => "ledger_ahead",
            Reconciliation::LocalAhead => "local_ahead",
            Reconciliation::Conflict => "conflict",
        }
    }

    pub fn classify(
        stage: Stage,
        local_hash: Option<ContentHash>,
        ledger_hash: Option<ContentHash>,
        local_state: Option<LifecycleState>,
        ledger_state: LifecycleState,
    ) -> Self {
        let reached = LifecycleState::reached_by(stage);
        let ledger_reached = ledger_state >= reached;
        let local_reached = local_state.is_some_and(|s| s >= reached);

        match (local_hash, ledger_hash) {
            (Some(l), Some(c)) if l != c => Reconciliation::Conflict,
            (None, Some(_)) => Reconciliation::LedgerAhead,
            (Some(_), None) => Reconciliation::LocalAhead,
            _ if ledger_reached && !local_reached => Reconciliation::LedgerAhead,
            _ if local_reached && !ledger_reached => Reconciliation::LocalAhead,
            _ => Reconciliation::Consistent,
        }
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub stage: Stage,
    pub bottle_id: String,
    pub ts: Option<i64>,
    pub row_key: RowKey,
    pub ledger_hash: Option<ContentHash>,
    pub local_hash: Option<ContentHash>,
    pub ledger_state: LifecycleState,
    pub local_state: Option<LifecycleState>,
    pub classification: Reconciliation,
}

/// Re-reads ledger truth and local rows for one stage after a partial commit
/// or a suspected divergence.
pub struct Reconciler {
    store: RecordStore,
    anchor: HashAnchor,
    lifecycle: LifecycleLedger,
}

impl Reconciler {
    pub fn new(store: RecordStore, client: Arc<LedgerClient>) -> Self {
        Self {
            store,
            anchor: HashAnchor::new(client.clone()),
            lifecycle: LifecycleLedger::new(client),
        }
    }

    pub async fn reconcile_partial(&self, partial: &PartialCommit) -> Result<ReconcileReport> {
        self.reconcile(partial.stage, &partial.bottle_id, partial.ts).await
    }

    /// Without `ts`, ship and deliver use the latest local milestone or sale.
    pub async fn reconcile(&self, stage: Stage, bottle_id: &str, ts: Option<i64>) -> Result<ReconcileReport> {
        let bottle = self.store.bottle(bottle_id).await?;
        let local = local_stage(&self.store, stage, bottle.as_ref(), ts).await?;

        let ts = match stage {
            Stage::Produce => None,
            _ => ts.or_else(|| local.as_ref().and_then(|l| l.ts)),
        };
        let key = row_key(stage, bottle_id, ts)?;

        let ledger_hash = self.anchor.read(&key).await?;
        let ledger_state = self.lifecycle.status(&bottle_key(bottle_id)).await?;
        let local_hash = local.as_ref().map(|l| l.record.content_hash());
        let local_state = bottle.as_ref().map(|b| b.current_status);

        let classification = Reconciliation::classify(stage, local_hash, ledger_hash, local_state, ledger_state);
        info!("reconcile {} {} at {}: {}", stage, bottle_id, key, classification);

        Ok(ReconcileReport {
            stage,
            bottle_id: bottle_id.to_string(),
            ts,
            row_key: key,
            ledger_hash,
            local_hash,
            ledger_state,
            local_state,
            classification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::content_hash;

    #[test]
    fn test_classification() {
        let a = content_hash(b"a");
        let b = content_hash(b"b");
        let produced = Some(LifecycleState::Produced);

        assert_eq!(
            Reconciliation::classify(Stage::Produce, Some(a), Some(a), produced, LifecycleState::Produced),
            Reconciliation::Consistent
        );
        assert_eq!(
            Reconciliation::classify(Stage::Produce, None, Some(a), None, LifecycleState::Produced),
            Reconciliation::LedgerAhead
        );
        assert_eq!(
            Reconciliation::classify(Stage::Produce, Some(a), None, produced, LifecycleState::None),
            Reconciliation::LocalAhead
        );
        assert_eq!(
            Reconciliation::classify(Stage::Produce, Some(a), Some(b), produced, LifecycleState::Produced),
            Reconciliation::Conflict
        );
    }

    #[test]
    fn test_transition_without_anchor_is_ledger_ahead() {
        assert_eq!(
            Reconciliation::classify(
                Stage::Ship,
                None,
                None,
                Some(LifecycleState::Produced),
                LifecycleState::InTransit
            ),
            Reconciliation::LedgerAhead
        );
        assert_eq!(
            Reconciliation::classify(Stage::Ship, None, None, Some(LifecycleState::Produced), LifecycleState::Produced),
            Reconciliation::Consistent
        );
    }
}
