mod deliver;
mod produce;
mod ship;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::canonical::CanonicalRecord;
use crate::error::{Result, TraceError};
use crate::keys::{bottle_key, row_key, BottleKey, RowKey, Stage};
use crate::ledger::{ContentHash, HashAnchor, LedgerClient, LifecycleLedger, LifecycleState};
use crate::store::{RecordStore, StoreTx};

pub use deliver::DeliverEvent;
pub use produce::BatchSubmission;
pub use ship::ShipEvent;

const DEFAULT_READ_BACK_ATTEMPTS: u32 = 3;
const READ_BACK_DELAY: Duration = Duration::from_millis(50);

/// What is known about one ledger write of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    NotIssued,
    Landed,
    Failed,
    Unknown,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::NotIssued => "not issued",
            WriteOutcome::Landed => "landed",
            WriteOutcome::Failed => "failed",
            WriteOutcome::Unknown => "unknown",
        }
    }
}

/// A run that mutated the ledger but rolled back locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialCommit {
    pub stage: Stage,
    pub bottle_id: String,
    pub ts: Option<i64>,
    pub row_key: RowKey,
    pub expected_hash: ContentHash,
    pub lifecycle: WriteOutcome,
    pub anchor: WriteOutcome,
    pub reason: String,
}

impl fmt::Display for PartialCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of '{}' rolled back locally after ledger writes (lifecycle {}, anchor {}); row key {}, expected hash {}: {}",
            self.stage,
            self.bottle_id,
            self.lifecycle.as_str(),
            self.anchor.as_str(),
            self.row_key,
            self.expected_hash,
            self.reason
        )
    }
}

/// Ledger side of a committed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorProof {
    pub row_key: RowKey,
    pub row_hash: ContentHash,
    pub canonical_json: String,
    pub transition_tx: Option<String>,
    pub anchor_tx: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub run_id: String,
    pub stage: Stage,
    pub bottle_id: String,
    /// `None` for rows stored without any ledger interaction.
    pub anchor: Option<AnchorProof>,
}

struct AnchorPlan {
    stage: Stage,
    bottle_id: String,
    ts: Option<i64>,
    bottle_key: BottleKey,
    row_key: RowKey,
    record: CanonicalRecord,
    transition: bool,
}

impl AnchorPlan {
    fn new(stage: Stage, bottle_id: &str, ts: Option<i64>, record: CanonicalRecord, transition: bool) -> Result<Self> {
        Ok(Self {
            stage,
            bottle_id: bottle_id.to_string(),
            ts,
            bottle_key: bottle_key(bottle_id),
            row_key: row_key(stage, bottle_id, ts)?,
            record,
            transition,
        })
    }
}

type BottleLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Held for the duration of one run. Releasing the last holder of a bottle's
/// lock drops its map entry.
struct BottleGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a BottleLocks,
    bottle_id: String,
}

impl Drop for BottleGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.bottle_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.bottle_id);
        }
    }
}

enum ReadBack {
    Value(ContentHash),
    Absent,
    Unreachable(String),
}

/// Runs each stage inside one local transaction, committed only once the
/// ledger side is confirmed.
pub struct IngestWorkflow {
    store: RecordStore,
    anchor: HashAnchor,
    lifecycle: LifecycleLedger,
    locks: BottleLocks,
    read_back_attempts: u32,
}

impl IngestWorkflow {
    pub fn new(store: RecordStore, client: Arc<LedgerClient>) -> Self {
        Self {
            store,
            anchor: HashAnchor::new(client.clone()),
            lifecycle: LifecycleLedger::new(client),
            locks: StdMutex::new(HashMap::new()),
            read_back_attempts: DEFAULT_READ_BACK_ATTEMPTS,
        }
    }

    pub fn with_read_back_attempts(mut self, attempts: u32) -> Self {
        self.read_back_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Serializes runs for one bottle.
    async fn lock_bottle(&self, bottle_id: &str) -> BottleGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(bottle_id.to_string()).or_default().clone()
        };
        BottleGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.locks,
            bottle_id: bottle_id.to_string(),
        }
    }

    async fn anchor_and_commit(&self, tx: StoreTx, plan: AnchorPlan) -> Result<AnchorProof> {
        let row_hash = plan.record.content_hash();
        let canonical_json = plan.record.to_json();

        debug!("compact JSON : {}", canonical_json);
        debug!("row_key      : {}", plan.row_key);
        debug!("row_hash     : {}", row_hash);

        match self.anchor.read(&plan.row_key).await {
            Ok(Some(existing)) if existing != row_hash => {
                return Err(abort(
                    tx,
                    TraceError::AnchorWrite {
                        row_key: plan.row_key.to_hex(),
                        reason: format!("key already bound to {}", existing),
                    },
                ));
            }
            Ok(_) => {}
            Err(e) => return Err(abort(tx, e)),
        }

        let mut lifecycle = WriteOutcome::NotIssued;
        let mut transition_tx = None;

        if plan.transition {
            match self.lifecycle.transition(plan.stage, &plan.bottle_key).await {
                Ok(receipt) => {
                    lifecycle = WriteOutcome::Landed;
                    transition_tx = Some(receipt.tx_hash);
                }
                Err(e @ TraceError::Ledger(_)) if e.is_retryable() => match self.confirm_transition(&plan).await {
                    Some(true) => {
                        warn!("{} transition outcome was lost but the ledger shows it landed", plan.stage);
                        lifecycle = WriteOutcome::Landed;
                    }
                    Some(false) => return Err(abort(tx, e)),
                    None => {
                        return Err(partial(tx, &plan, row_hash, WriteOutcome::Unknown, WriteOutcome::NotIssued, e.to_string()));
                    }
                },
                Err(e) => return Err(abort(tx, e)),
            }
        }

        let anchor_tx = match self.anchor.write(&plan.row_key, &row_hash).await {
            Ok(receipt) => Some(receipt.tx_hash),
            Err(TraceError::AnchorUnavailable(reason)) => {
                warn!("storeHash outcome unknown ({}), re-querying the ledger", reason);
                None
            }
            Err(e) if lifecycle == WriteOutcome::Landed => {
                return Err(partial(tx, &plan, row_hash, lifecycle, WriteOutcome::Failed, e.to_string()));
            }
            Err(e) => return Err(abort(tx, e)),
        };

        let anchor_state = if anchor_tx.is_some() {
            WriteOutcome::Landed
        } else {
            WriteOutcome::Unknown
        };

        match self.read_back(&plan.row_key).await {
            ReadBack::Value(chain_hash) if chain_hash == row_hash => {
                debug!("chain hash {} matches local row_hash", chain_hash);
            }
            ReadBack::Value(chain_hash) => {
                let reason = format!("ledger holds {} instead of {}", chain_hash, row_hash);
                return Err(partial(tx, &plan, row_hash, lifecycle, anchor_state, reason));
            }
            ReadBack::Absent if anchor_tx.is_none() && lifecycle != WriteOutcome::Landed => {
                return Err(abort(
                    tx,
                    TraceError::AnchorUnavailable(format!("storeHash for {} did not land", plan.row_key)),
                ));
            }
            ReadBack::Absent => {
                let anchor = if anchor_tx.is_some() { WriteOutcome::Unknown } else { WriteOutcome::Failed };
                let reason = format!("no hash readable under {} after write", plan.row_key);
                return Err(partial(tx, &plan, row_hash, lifecycle, anchor, reason));
            }
            ReadBack::Unreachable(reason) => {
                let reason = format!("read-back failed: {}", reason);
                return Err(partial(tx, &plan, row_hash, lifecycle, anchor_state, reason));
            }
        }

        if let Err(e) = tx.commit() {
            return Err(TraceError::PartialCommit(Box::new(PartialCommit {
                stage: plan.stage,
                bottle_id: plan.bottle_id,
                ts: plan.ts,
                row_key: plan.row_key,
                expected_hash: row_hash,
                lifecycle,
                anchor: WriteOutcome::Landed,
                reason: format!("local commit failed: {}", e),
            })));
        }

        Ok(AnchorProof {
            row_key: plan.row_key,
            row_hash,
            canonical_json,
            transition_tx,
            anchor_tx,
        })
    }

    async fn read_back(&self, key: &RowKey) -> ReadBack {
        let mut last = ReadBack::Absent;
        for attempt in 1..=self.read_back_attempts {
            match self.anchor.read(key).await {
                Ok(Some(hash)) => return ReadBack::Value(hash),
                Ok(None) => last = ReadBack::Absent,
                Err(e) => {
                    warn!("getProof attempt {}/{} failed: {}", attempt, self.read_back_attempts, e);
                    last = ReadBack::Unreachable(e.to_string());
                }
            }
            if attempt < self.read_back_attempts {
                tokio::time::sleep(READ_BACK_DELAY * attempt).await;
            }
        }
        last
    }

    /// `Some(true)` if the ledger state shows the transition landed,
    /// `Some(false)` if it did not, `None` if the state could not be read.
    async fn confirm_transition(&self, plan: &AnchorPlan) -> Option<bool> {
        let reached = LifecycleState::reached_by(plan.stage);
        for attempt in 1..=self.read_back_attempts {
            match self.lifecycle.status(&plan.bottle_key).await {
                Ok(state) => return Some(state >= reached),
                Err(e) => warn!("status attempt {}/{} failed: {}", attempt, self.read_back_attempts, e),
            }
            if attempt < self.read_back_attempts {
                tokio::time::sleep(READ_BACK_DELAY * attempt).await;
            }
        }
        None
    }
}

fn abort(tx: StoreTx, err: TraceError) -> TraceError {
    if let Err(e) = tx.rollback() {
        error!("rollback failed: {}", e);
    }
    info!("❌ rolled back: {}", err);
    err
}

fn partial(
    tx: StoreTx,
    plan: &AnchorPlan,
    expected_hash: ContentHash,
    lifecycle: WriteOutcome,
    anchor: WriteOutcome,
    reason: String,
) -> TraceError {
    if let Err(e) = tx.rollback() {
        error!("rollback failed: {}", e);
    }
    let partial = PartialCommit {
        stage: plan.stage,
        bottle_id: plan.bottle_id.clone(),
        ts: plan.ts,
        row_key: plan.row_key,
        expected_hash,
        lifecycle,
        anchor,
        reason,
    };
    error!("partial commit: {}", partial);
    TraceError::PartialCommit(Box::new(partial))
}

fn validation(err: TraceError) -> TraceError {
    match err {
        TraceError::Canonical(msg) => TraceError::Validation(msg),
        other => other,
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
