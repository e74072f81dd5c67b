use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerError;
use crate::keys::{BottleKey, RowKey};
use super::anchor::content_hash;
use super::{ContentHash, Ledger, LedgerCall, LifecycleState, RevertReason, TxReceipt, TxStatus};

/// Failures to inject into a [`MemoryLedger`]. Counters are consumed one per
/// matching call.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Submits refused before reaching the ledger; nothing lands.
    pub refused_submits: u32,
    /// Submits that land but whose receipt never comes back.
    pub lost_receipts: u32,
    /// `getProof` reads that fail with a connection error.
    pub failed_reads: u32,
    /// Read failures queued up once the next `storeHash` lands, so pre-write
    /// reads of the same run stay healthy.
    pub failed_reads_after_store: u32,
    /// Restrict submit faults to one call name, e.g. `"storeHash"`.
    pub only_call: Option<&'static str>,
    pub offline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxRecord {
    tx_hash: String,
    nonce: u64,
    block: u64,
    call: String,
    target: String,
    success: bool,
    at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerSnapshot {
    next_nonce: u64,
    block: u64,
    /// row key hex -> content hash hex
    anchors: BTreeMap<String, String>,
    /// bottle key hex -> lifecycle state
    bottles: BTreeMap<String, LifecycleState>,
    #[serde(default)]
    transactions: Vec<TxRecord>,
}

/// In-process ledger with the contract semantics of the lifecycle and audit
/// contracts. With a snapshot path, every mined transaction is persisted so
/// separate processes observe one ledger.
pub struct MemoryLedger {
    state: Mutex<LedgerSnapshot>,
    faults: Mutex<FaultPlan>,
    snapshot_path: Option<PathBuf>,
}

enum SubmitFault {
    Refuse,
    LoseReceipt,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerSnapshot::default()),
            faults: Mutex::new(FaultPlan::default()),
            snapshot_path: None,
        }
    }

    /// Open a file-backed ledger, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| snapshot_error(&path, e))?;
            serde_json::from_str(&raw).map_err(|e| snapshot_error(&path, e))?
        } else {
            LedgerSnapshot::default()
        };

        debug!("ledger snapshot {} loaded at block {}", path.display(), snapshot.block);

        Ok(Self {
            state: Mutex::new(snapshot),
            faults: Mutex::new(FaultPlan::default()),
            snapshot_path: Some(path),
        })
    }

    /// Adjust the fault plan in place.
    pub fn faults(&self, f: impl FnOnce(&mut FaultPlan)) {
        if let Ok(mut plan) = self.faults.lock() {
            f(&mut plan);
        }
    }

    pub fn clear_faults(&self) {
        self.faults(|f| *f = FaultPlan::default());
    }

    /// Direct view of an anchor, bypassing faults.
    pub fn anchor(&self, key: &RowKey) -> Option<ContentHash> {
        let state = self.state.lock().ok()?;
        state.anchors.get(&key.to_hex()).and_then(|h| ContentHash::from_hex(h))
    }

    /// Direct view of a bottle's state, bypassing faults.
    pub fn lifecycle(&self, key: &BottleKey) -> LifecycleState {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.bottles.get(&key.to_hex()).copied())
            .unwrap_or_default()
    }

    /// Write the snapshot file even if no transaction has been mined yet.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let state = self.lock()?;
        self.persist(&state)
    }

    pub fn transaction_total(&self) -> usize {
        self.state.lock().map(|s| s.transactions.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerSnapshot>, LedgerError> {
        self.state.lock().map_err(|e| LedgerError::Unavailable {
            operation: "lock".into(),
            reason: e.to_string(),
        })
    }

    fn check_online(&self, operation: &str) -> Result<(), LedgerError> {
        let offline = self.faults.lock().map(|f| f.offline).unwrap_or(false);
        if offline {
            return Err(LedgerError::Unavailable {
                operation: operation.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn take_submit_fault(&self, call: &LedgerCall) -> Option<SubmitFault> {
        let mut plan = self.faults.lock().ok()?;
        if let Some(only) = plan.only_call {
            if only != call.name() {
                return None;
            }
        }
        if plan.refused_submits > 0 {
            plan.refused_submits -= 1;
            return Some(SubmitFault::Refuse);
        }
        if plan.lost_receipts > 0 {
            plan.lost_receipts -= 1;
            return Some(SubmitFault::LoseReceipt);
        }
        None
    }

    fn take_read_fault(&self) -> bool {
        match self.faults.lock() {
            Ok(mut plan) if plan.failed_reads > 0 => {
                plan.failed_reads -= 1;
                true
            }
            _ => false,
        }
    }

    fn arm_read_faults(&self) {
        if let Ok(mut plan) = self.faults.lock() {
            plan.failed_reads += std::mem::take(&mut plan.failed_reads_after_store);
        }
    }

    fn persist(&self, state: &LedgerSnapshot) -> Result<(), LedgerError> {
        if let Some(path) = &self.snapshot_path {
            let raw = serde_json::to_string_pretty(state).map_err(|e| snapshot_error(path, e))?;
            std::fs::write(path, raw).map_err(|e| snapshot_error(path, e))?;
        }
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_error(path: &Path, err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Snapshot {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

fn apply(state: &mut LedgerSnapshot, call: &LedgerCall) -> TxStatus {
    match call {
        LedgerCall::Produce(key) | LedgerCall::Ship(key) | LedgerCall::Deliver(key) => {
            let current = state.bottles.get(&key.to_hex()).copied().unwrap_or_default();
            let (expected, next) = match call {
                LedgerCall::Produce(_) => (LifecycleState::None, LifecycleState::Produced),
                LedgerCall::Ship(_) => (LifecycleState::Produced, LifecycleState::InTransit),
                _ => (LifecycleState::InTransit, LifecycleState::Delivered),
            };
            if current != expected {
                return TxStatus::Reverted(RevertReason::InvalidTransition { current });
            }
            state.bottles.insert(key.to_hex(), next);
            TxStatus::Success
        }
        LedgerCall::StoreHash { key, hash } => {
            match state.anchors.get(&key.to_hex()).and_then(|h| ContentHash::from_hex(h)) {
                Some(existing) if existing == *hash => TxStatus::Success,
                Some(existing) => TxStatus::Reverted(RevertReason::HashConflict { existing }),
                None => {
                    state.anchors.insert(key.to_hex(), hash.to_hex());
                    TxStatus::Success
                }
            }
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn submit(&self, call: LedgerCall, nonce: u64) -> Result<TxReceipt, LedgerError> {
        self.check_online(call.name())?;

        let fault = self.take_submit_fault(&call);
        if let Some(SubmitFault::Refuse) = fault {
            return Err(LedgerError::Unavailable {
                operation: call.name().to_string(),
                reason: "connection reset before broadcast".into(),
            });
        }

        let receipt = {
            let mut state = self.lock()?;
            if nonce != state.next_nonce {
                return Err(LedgerError::Reverted {
                    call: call.name().to_string(),
                    tx_hash: "-".into(),
                    reason: format!("nonce {} rejected, expected {}", nonce, state.next_nonce),
                });
            }

            let status = apply(&mut state, &call);
            if matches!(call, LedgerCall::StoreHash { .. }) && status == TxStatus::Success {
                self.arm_read_faults();
            }
            state.block += 1;
            state.next_nonce += 1;
            let block = state.block;

            let tx_hash = content_hash(
                format!("{}:{}:{}:{}", nonce, block, call.name(), call.target_hex()).as_bytes(),
            )
            .to_hex();

            state.transactions.push(TxRecord {
                tx_hash: tx_hash.clone(),
                nonce,
                block,
                call: call.name().to_string(),
                target: call.target_hex(),
                success: status == TxStatus::Success,
                at: Utc::now(),
            });
            self.persist(&state)?;

            TxReceipt {
                tx_hash,
                nonce,
                block,
                status,
            }
        };

        if let Some(SubmitFault::LoseReceipt) = fault {
            return Err(LedgerError::Timeout {
                operation: call.name().to_string(),
                duration_ms: None,
            });
        }

        Ok(receipt)
    }

    async fn get_proof(&self, key: &RowKey) -> Result<Option<ContentHash>, LedgerError> {
        self.check_online("getProof")?;
        if self.take_read_fault() {
            return Err(LedgerError::Unavailable {
                operation: "getProof".into(),
                reason: "read timed out at RPC endpoint".into(),
            });
        }
        let state = self.lock()?;
        Ok(state.anchors.get(&key.to_hex()).and_then(|h| ContentHash::from_hex(h)))
    }

    async fn status(&self, key: &BottleKey) -> Result<LifecycleState, LedgerError> {
        self.check_online("status")?;
        let state = self.lock()?;
        Ok(state.bottles.get(&key.to_hex()).copied().unwrap_or_default())
    }

    async fn transaction_count(&self) -> Result<u64, LedgerError> {
        self.check_online("getTransactionCount")?;
        Ok(self.lock()?.next_nonce)
    }
}
