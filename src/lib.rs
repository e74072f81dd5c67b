pub mod error;
pub mod config;
pub mod keys;
pub mod canonical;
pub mod ledger;
pub mod store;
pub mod workflow;
pub mod verify;
pub mod diff;

pub use error::{LedgerError, TraceError, Result};
pub use config::TraceConfig;
pub use keys::{Stage, RowKey, BottleKey, row_key, bottle_key};
pub use canonical::{CanonicalRecord, FieldKind, canonicalize, encode_object, encode_value};
pub use ledger::{
    ContentHash, HashAnchor, Ledger, LedgerCall, LedgerClient, LifecycleLedger, LifecycleState,
    MemoryLedger, FaultPlan, TxReceipt, TxStatus, RevertReason, content_hash,
};
pub use store::{RecordStore, StoreTx, Batch, Bottle, TransportEvent, SoldEvent};
pub use workflow::{IngestWorkflow, IngestReceipt, AnchorProof, PartialCommit, WriteOutcome, BatchSubmission, ShipEvent, DeliverEvent};
pub use verify::{AuditVerifier, AuditReport, AuditTableRow, StageCheck, CheckOutcome, VerifiedDetail, Diagnosis, Reconciler, ReconcileReport, Reconciliation};
pub use diff::{format_canonical_diff, has_changes};
