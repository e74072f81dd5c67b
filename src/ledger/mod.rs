mod anchor;
mod client;
mod lifecycle;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::keys::{BottleKey, RowKey, Stage};

pub use anchor::{content_hash, ContentHash, HashAnchor};
pub use client::LedgerClient;
pub use lifecycle::LifecycleLedger;
pub use memory::{FaultPlan, MemoryLedger};

/// Bottle lifecycle as tracked by the ledger contract. Codes match the
/// contract's enum ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    None,
    Produced,
    InTransit,
    Delivered,
}

impl LifecycleState {
    pub fn code(&self) -> u8 {
        match self {
            LifecycleState::None => 0,
            LifecycleState::Produced => 1,
            LifecycleState::InTransit => 2,
            LifecycleState::Delivered => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LifecycleState::None),
            1 => Some(LifecycleState::Produced),
            2 => Some(LifecycleState::InTransit),
            3 => Some(LifecycleState::Delivered),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::None => "None",
            LifecycleState::Produced => "Produced",
            LifecycleState::InTransit => "InTransit",
            LifecycleState::Delivered => "Delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "None" => Some(LifecycleState::None),
            "Produced" => Some(LifecycleState::Produced),
            "InTransit" => Some(LifecycleState::InTransit),
            "Delivered" => Some(LifecycleState::Delivered),
            _ => None,
        }
    }

    /// State a bottle must be in before `stage` may run.
    pub fn predecessor_of(stage: Stage) -> Self {
        match stage {
            Stage::Produce => LifecycleState::None,
            Stage::Ship => LifecycleState::Produced,
            Stage::Deliver => LifecycleState::InTransit,
        }
    }

    /// State reached once `stage` has been applied.
    pub fn reached_by(stage: Stage) -> Self {
        match stage {
            Stage::Produce => LifecycleState::Produced,
            Stage::Ship => LifecycleState::InTransit,
            Stage::Deliver => LifecycleState::Delivered,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Delivered)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    Produce(BottleKey),
    Ship(BottleKey),
    Deliver(BottleKey),
    StoreHash { key: RowKey, hash: ContentHash },
}

impl LedgerCall {
    pub fn transition(stage: Stage, key: BottleKey) -> Self {
        match stage {
            Stage::Produce => LedgerCall::Produce(key),
            Stage::Ship => LedgerCall::Ship(key),
            Stage::Deliver => LedgerCall::Deliver(key),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::Produce(_) => "produce",
            LedgerCall::Ship(_) => "ship",
            LedgerCall::Deliver(_) => "deliver",
            LedgerCall::StoreHash { .. } => "storeHash",
        }
    }

    pub fn target_hex(&self) -> String {
        match self {
            LedgerCall::Produce(k) | LedgerCall::Ship(k) | LedgerCall::Deliver(k) => k.to_hex(),
            LedgerCall::StoreHash { key, .. } => key.to_hex(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RevertReason {
    InvalidTransition { current: LifecycleState },
    HashConflict { existing: ContentHash },
    Other(String),
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertReason::InvalidTransition { current } => write!(f, "bad state {}", current),
            RevertReason::HashConflict { existing } => write!(f, "key already bound to {}", existing),
            RevertReason::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TxStatus {
    Success,
    Reverted(RevertReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub nonce: u64,
    pub block: u64,
    pub status: TxStatus,
}

impl TxReceipt {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}

/// Remote append-only ledger: lifecycle contract plus key→hash audit store.
///
/// `submit` resolves once the receipt is known. Reverted transactions still
/// produce a receipt and consume the nonce.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit(&self, call: LedgerCall, nonce: u64) -> Result<TxReceipt, LedgerError>;

    async fn get_proof(&self, key: &RowKey) -> Result<Option<ContentHash>, LedgerError>;

    async fn status(&self, key: &BottleKey) -> Result<LifecycleState, LedgerError>;

    /// Next nonce the ledger will accept from this sender.
    async fn transaction_count(&self) -> Result<u64, LedgerError>;
}
