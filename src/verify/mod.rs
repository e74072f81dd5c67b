mod diagnose;
mod reconcile;

use std::sync::Arc;

use serde::Serialize;
use tabled::Tabled;
use tracing::{debug, info};

use crate::canonical::{canonicalize, CanonicalRecord};
use crate::error::Result;
use crate::keys::{bottle_key, row_key, RowKey, Stage};
use crate::ledger::{ContentHash, HashAnchor, LedgerClient, LifecycleLedger, LifecycleState};
use crate::store::{Batch, Bottle, RecordStore, SoldEvent, TransportEvent};

pub use diagnose::Diagnosis;
pub use reconcile::{ReconcileReport, Reconciler, Reconciliation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Match,
    Mismatch,
    /// No local row, no ledger value, or only one of the two.
    Missing,
    /// Hashes agree but the ledger lifecycle has not reached the stage.
    StateHashDivergence,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Match => "match",
            CheckOutcome::Mismatch => "mismatch",
            CheckOutcome::Missing => "missing",
            CheckOutcome::StateHashDivergence => "state_hash_divergence",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CheckOutcome::Match => "✓",
            CheckOutcome::Mismatch => "×",
            CheckOutcome::Missing => "○",
            CheckOutcome::StateHashDivergence => "⚠",
        }
    }

    pub fn classify(stage: Stage, local: Option<ContentHash>, ledger: Option<ContentHash>, state: LifecycleState) -> Self {
        match (local, ledger) {
            (Some(l), Some(c)) if l == c => {
                if state >= LifecycleState::reached_by(stage) {
                    CheckOutcome::Match
                } else {
                    CheckOutcome::StateHashDivergence
                }
            }
            (Some(_), Some(_)) => CheckOutcome::Mismatch,
            _ => CheckOutcome::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageCheck {
    pub stage: Stage,
    pub ts: Option<i64>,
    /// `None` when no local row exists to take a timestamp from.
    pub row_key: Option<RowKey>,
    pub canonical_json: Option<String>,
    pub local_hash: Option<ContentHash>,
    pub ledger_hash: Option<ContentHash>,
    pub outcome: CheckOutcome,
}

impl StageCheck {
    pub fn detail(&self) -> &'static str {
        match (self.outcome, self.local_hash.is_some(), self.ledger_hash.is_some()) {
            (CheckOutcome::Missing, false, true) => "missing locally",
            (CheckOutcome::Missing, true, false) => "missing on ledger",
            (CheckOutcome::Missing, false, false) if self.stage.is_timestamped() => "no local row",
            (CheckOutcome::Missing, false, false) => "missing on both sides",
            (outcome, _, _) => outcome.as_str(),
        }
    }
}

/// Full local rows of a bottle whose every stage matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedDetail {
    pub bottle: Bottle,
    pub batch: Option<Batch>,
    pub transport_events: Vec<TransportEvent>,
    pub sold_event: Option<SoldEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub bottle_id: String,
    pub ledger_state: LifecycleState,
    pub local_status: Option<LifecycleState>,
    pub checks: Vec<StageCheck>,
    pub detail: Option<VerifiedDetail>,
}

impl AuditReport {
    pub fn check(&self, stage: Stage) -> Option<&StageCheck> {
        self.checks.iter().find(|c| c.stage == stage)
    }

    pub fn outcome(&self, stage: Stage) -> Option<CheckOutcome> {
        self.check(stage).map(|c| c.outcome)
    }

    pub fn all_match(&self) -> bool {
        self.checks.iter().all(|c| c.outcome == CheckOutcome::Match)
    }

    pub fn divergences(&self) -> Vec<&StageCheck> {
        self.checks
            .iter()
            .filter(|c| c.outcome == CheckOutcome::StateHashDivergence)
            .collect()
    }

    pub fn table_rows(&self) -> Vec<AuditTableRow> {
        self.checks.iter().map(AuditTableRow::from).collect()
    }
}

#[derive(Debug, Clone, Tabled)]
pub struct AuditTableRow {
    #[tabled(rename = "Stage")]
    pub stage: String,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "✓/×")]
    pub symbol: String,
    #[tabled(rename = "Row key")]
    pub row_key: String,
    #[tabled(rename = "Ledger hash")]
    pub ledger_hash: String,
    #[tabled(rename = "Local hash")]
    pub local_hash: String,
}

impl From<&StageCheck> for AuditTableRow {
    fn from(check: &StageCheck) -> Self {
        let stage = match check.ts {
            Some(ts) => format!("{} @{}", check.stage, ts),
            None => check.stage.to_string(),
        };

        AuditTableRow {
            stage,
            result: check.detail().to_string(),
            symbol: check.outcome.symbol().to_string(),
            row_key: short_hex(check.row_key.map(|k| k.to_hex())),
            ledger_hash: short_hex(check.ledger_hash.map(|h| h.to_hex())),
            local_hash: short_hex(check.local_hash.map(|h| h.to_hex())),
        }
    }
}

fn short_hex(value: Option<String>) -> String {
    match value {
        Some(hex) if hex.len() > 14 => format!("{}…{}", &hex[..8], &hex[hex.len() - 4..]),
        Some(hex) => hex,
        None => "-".to_string(),
    }
}

/// Canonical record a stage would have anchored, rebuilt from the store.
pub(crate) struct LocalStage {
    pub ts: Option<i64>,
    pub record: CanonicalRecord,
}

/// Rebuild `stage` for a bottle. Ship and deliver take the row at `ts` when
/// given, otherwise the latest milestone or the sale.
pub(crate) async fn local_stage(
    store: &RecordStore,
    stage: Stage,
    bottle: Option<&Bottle>,
    ts: Option<i64>,
) -> Result<Option<LocalStage>> {
    let bottle = match bottle {
        Some(b) => b,
        None => return Ok(None),
    };

    match stage {
        Stage::Produce => {
            let record = canonicalize(Stage::Produce, &bottle.submission()?)?;
            Ok(Some(LocalStage { ts: None, record }))
        }
        Stage::Ship => {
            let event = match ts {
                Some(ts) => store.milestone_at(&bottle.id, ts).await?,
                None => store.latest_milestone(&bottle.id).await?,
            };
            match event {
                Some(event) => Ok(Some(LocalStage {
                    ts: Some(event.ts),
                    record: canonicalize(Stage::Ship, &event.row_map())?,
                })),
                None => Ok(None),
            }
        }
        Stage::Deliver => match store.sold_event(&bottle.id).await? {
            Some(sold) if ts.map_or(true, |t| t == sold.ts) => Ok(Some(LocalStage {
                ts: Some(sold.ts),
                record: canonicalize(Stage::Deliver, &sold.row_map())?,
            })),
            _ => Ok(None),
        },
    }
}

pub struct AuditVerifier {
    store: RecordStore,
    anchor: HashAnchor,
    lifecycle: LifecycleLedger,
}

impl AuditVerifier {
    pub fn new(store: RecordStore, client: Arc<LedgerClient>) -> Self {
        Self {
            store,
            anchor: HashAnchor::new(client.clone()),
            lifecycle: LifecycleLedger::new(client),
        }
    }

    pub async fn verify(&self, bottle_id: &str) -> Result<AuditReport> {
        let bottle = self.store.bottle(bottle_id).await?;
        let ledger_state = self.lifecycle.status(&bottle_key(bottle_id)).await?;

        let mut checks = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let check = self.check_stage(stage, bottle_id, bottle.as_ref(), ledger_state).await?;
            debug!(
                "[{}] row_key {:?} ledger {:?} local {:?}",
                stage, check.row_key, check.ledger_hash, check.local_hash
            );
            checks.push(check);
        }

        let mut report = AuditReport {
            bottle_id: bottle_id.to_string(),
            ledger_state,
            local_status: bottle.as_ref().map(|b| b.current_status),
            checks,
            detail: None,
        };

        if report.all_match() {
            if let Some(bottle) = bottle {
                report.detail = Some(self.detail(bottle).await?);
            }
        }

        info!(
            "verified {}: {} (ledger state {})",
            bottle_id,
            if report.all_match() { "all stages match" } else { "not all stages match" },
            ledger_state
        );

        Ok(report)
    }

    async fn check_stage(
        &self,
        stage: Stage,
        bottle_id: &str,
        bottle: Option<&Bottle>,
        ledger_state: LifecycleState,
    ) -> Result<StageCheck> {
        let local = local_stage(&self.store, stage, bottle, None).await?;
        let ts = local.as_ref().and_then(|l| l.ts);

        let row_key = match (stage.is_timestamped(), ts) {
            (false, _) => Some(row_key(stage, bottle_id, None)?),
            (true, Some(ts)) => Some(row_key(stage, bottle_id, Some(ts))?),
            (true, None) => None,
        };

        let ledger_hash = match &row_key {
            Some(key) => self.anchor.read(key).await?,
            None => None,
        };
        let local_hash = local.as_ref().map(|l| l.record.content_hash());

        Ok(StageCheck {
            stage,
            ts,
            row_key,
            canonical_json: local.as_ref().map(|l| l.record.to_json()),
            local_hash,
            ledger_hash,
            outcome: CheckOutcome::classify(stage, local_hash, ledger_hash, ledger_state),
        })
    }

    async fn detail(&self, bottle: Bottle) -> Result<VerifiedDetail> {
        let batch = self.store.batch(bottle.batch_id).await?;
        let transport_events = self.store.transport_events(&bottle.id).await?;
        let sold_event = self.store.sold_event(&bottle.id).await?;
        Ok(VerifiedDetail {
            bottle,
            batch,
            transport_events,
            sold_event,
        })
    }
}
