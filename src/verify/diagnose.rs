use serde::Serialize;
use serde_json::{Map, Value};
use tabled::Tabled;

use crate::canonical::{canonicalize, encode_object};
use crate::diff::{format_canonical_diff, has_changes};
use crate::error::Result;
use crate::keys::{row_key, RowKey, Stage};
use crate::ledger::{content_hash, ContentHash};
use crate::workflow::{DeliverEvent, ShipEvent};
use super::{local_stage, AuditVerifier};

/// Every fingerprint of one stage, side by side: the canonical JSON of the
/// original submission, of the stored subset and of the full stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub stage: Stage,
    pub bottle_id: String,
    pub ts: Option<i64>,
    pub row_key: RowKey,
    pub ledger_hash: Option<ContentHash>,
    pub file_json: String,
    pub file_hash: ContentHash,
    pub store_json: Option<String>,
    pub store_hash: Option<ContentHash>,
    pub row_json: Option<String>,
    pub row_hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Tabled)]
pub struct FingerprintRow {
    #[tabled(rename = "Source")]
    pub source: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl Diagnosis {
    pub fn file_matches_ledger(&self) -> bool {
        self.ledger_hash == Some(self.file_hash)
    }

    pub fn store_matches_ledger(&self) -> bool {
        self.store_hash.is_some() && self.ledger_hash == self.store_hash
    }

    /// Line diff of the submitted canonical JSON against the stored one.
    pub fn diff(&self) -> Option<String> {
        let stored = self.store_json.as_deref()?;
        if has_changes(&self.file_json, stored) {
            Some(format_canonical_diff(&self.file_json, stored))
        } else {
            None
        }
    }

    pub fn fingerprints(&self) -> Vec<FingerprintRow> {
        let opt = |h: Option<ContentHash>| h.map(|h| h.to_hex()).unwrap_or_else(|| "-".to_string());
        vec![
            FingerprintRow { source: "row key".into(), value: self.row_key.to_hex() },
            FingerprintRow { source: "ledger hash".into(), value: opt(self.ledger_hash) },
            FingerprintRow { source: "file sha256".into(), value: self.file_hash.to_hex() },
            FingerprintRow { source: "store subset sha256".into(), value: opt(self.store_hash) },
            FingerprintRow { source: "full row sha256".into(), value: opt(self.row_hash) },
        ]
    }
}

impl AuditVerifier {
    /// Explain a failed check for one stage, given the submission that was
    /// originally anchored.
    pub async fn diagnose(&self, stage: Stage, bottle_id: &str, submission: &Map<String, Value>) -> Result<Diagnosis> {
        let (ts, file_record) = match stage {
            Stage::Produce => (None, canonicalize(Stage::Produce, submission)?),
            Stage::Ship => {
                let event = ShipEvent::from_submission(bottle_id, submission)?;
                (Some(event.ts), canonicalize(Stage::Ship, event.fields())?)
            }
            Stage::Deliver => {
                let event = DeliverEvent::from_submission(submission)?;
                (Some(event.ts), canonicalize(Stage::Deliver, event.fields())?)
            }
        };

        let key = row_key(stage, bottle_id, ts)?;
        let ledger_hash = self.anchor.read(&key).await?;

        let bottle = self.store.bottle(bottle_id).await?;
        let stored = local_stage(&self.store, stage, bottle.as_ref(), ts).await?;

        let full_row = match (stage, &bottle) {
            (_, None) => None,
            (Stage::Produce, Some(b)) => Some(b.row_map()),
            (Stage::Ship, Some(b)) => match ts {
                Some(ts) => self.store.milestone_at(&b.id, ts).await?.map(|e| e.row_map()),
                None => None,
            },
            (Stage::Deliver, Some(b)) => self
                .store
                .sold_event(&b.id)
                .await?
                .filter(|s| Some(s.ts) == ts)
                .map(|s| s.row_map()),
        };
        let row_json = full_row.as_ref().map(encode_object);

        Ok(Diagnosis {
            stage,
            bottle_id: bottle_id.to_string(),
            ts,
            row_key: key,
            ledger_hash,
            file_json: file_record.to_json(),
            file_hash: file_record.content_hash(),
            store_json: stored.as_ref().map(|s| s.record.to_json()),
            store_hash: stored.as_ref().map(|s| s.record.content_hash()),
            row_hash: row_json.as_ref().map(|j| content_hash(j.as_bytes())),
            row_json,
        })
    }
}
