use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, Instrument};

use crate::canonical::{canonicalize, encode_object};
use crate::error::{Result, TraceError};
use crate::keys::{bottle_key, Stage};
use crate::ledger::LifecycleState;
use crate::store::{Batch, Bottle};
use super::{abort, new_run_id, AnchorPlan, AnchorProof, IngestReceipt, IngestWorkflow};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchSubmission {
    pub id: i64,
    #[serde(default)]
    pub winery_code: Option<String>,
    #[serde(default)]
    pub vintage: Option<i64>,
    #[serde(default)]
    pub harvest_year: Option<i64>,
    #[serde(default)]
    pub variety: Option<String>,
    #[serde(default)]
    pub vineyard: Option<String>,
}

impl BatchSubmission {
    pub fn to_batch(&self) -> Batch {
        Batch {
            id: self.id,
            winery_code: self.winery_code.clone(),
            vintage: self.vintage,
            harvest_year: self.harvest_year,
            variety: self.variety.clone(),
            vineyard: self.vineyard.clone(),
        }
    }
}

fn submitted_bottle_id(bottle: &Map<String, Value>) -> Result<String> {
    match bottle.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => Err(TraceError::Validation("bottle submission needs a non-empty string 'id'".into())),
    }
}

impl IngestWorkflow {
    /// Register a new bottle (and its batch, if unknown) and anchor the
    /// submission as received.
    pub async fn produce(&self, batch: &BatchSubmission, bottle: &Map<String, Value>) -> Result<IngestReceipt> {
        let bottle_id = submitted_bottle_id(bottle)?;
        let run_id = new_run_id();
        let span = tracing::info_span!("produce", run = %run_id, bottle = %bottle_id);

        let proof = async {
            let _guard = self.lock_bottle(&bottle_id).await;
            self.produce_locked(&bottle_id, batch, bottle).await
        }
        .instrument(span)
        .await?;

        Ok(IngestReceipt {
            run_id,
            stage: Stage::Produce,
            bottle_id,
            anchor: Some(proof),
        })
    }

    async fn produce_locked(
        &self,
        bottle_id: &str,
        batch: &BatchSubmission,
        bottle: &Map<String, Value>,
    ) -> Result<AnchorProof> {
        if let Some(declared) = bottle.get("batch_id") {
            if declared.as_i64() != Some(batch.id) {
                return Err(TraceError::Validation(format!(
                    "bottle '{}' declares batch_id {} but batch {} was submitted",
                    bottle_id, declared, batch.id
                )));
            }
        }

        let retailer = match bottle.get("retailer") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(TraceError::Validation(format!("retailer must be a string, got {}", other)));
            }
        };

        let tx = self.store.begin().await?;

        if tx.bottle(bottle_id)?.is_some() {
            return Err(abort(
                tx,
                TraceError::Validation(format!("bottle '{}' already exists", bottle_id)),
            ));
        }

        let wanted = batch.to_batch();
        match tx.batch(batch.id)? {
            Some(existing) if existing == wanted => debug!("reusing batch {}", batch.id),
            Some(existing) => {
                return Err(abort(
                    tx,
                    TraceError::Validation(format!(
                        "batch {} already exists with different attributes ({:?})",
                        batch.id, existing
                    )),
                ));
            }
            None => {
                tx.insert_batch(&wanted)?;
                info!("📥 new batch {}", batch.id);
            }
        }

        tx.insert_bottle(&Bottle {
            id: bottle_id.to_string(),
            batch_id: batch.id,
            current_status: LifecycleState::Produced,
            retailer,
            bottle_key: bottle_key(bottle_id).to_hex(),
            submission_json: encode_object(bottle),
        })?;
        info!("📥 new bottle {}", bottle_id);

        let record = canonicalize(Stage::Produce, bottle)?;
        let plan = AnchorPlan::new(Stage::Produce, bottle_id, None, record, true)?;
        let proof = self.anchor_and_commit(tx, plan).await?;
        info!("✅ bottle {} produced and anchored", bottle_id);
        Ok(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bottle_id_required() {
        let missing = json!({"batch_id": 1}).as_object().cloned().unwrap();
        assert!(matches!(submitted_bottle_id(&missing), Err(TraceError::Validation(_))));

        let numeric = json!({"id": 7}).as_object().cloned().unwrap();
        assert!(submitted_bottle_id(&numeric).is_err());

        let ok = json!({"id": "coco1514"}).as_object().cloned().unwrap();
        assert_eq!(submitted_bottle_id(&ok).unwrap(), "coco1514");
    }

    #[test]
    fn test_batch_submission_defaults() {
        let batch: BatchSubmission = serde_json::from_str(r#"{"id":1,"variety":"Merlot"}"#).unwrap();
        let row = batch.to_batch();
        assert_eq!(row.id, 1);
        assert_eq!(row.variety.as_deref(), Some("Merlot"));
        assert!(row.vineyard.is_none());
    }
}
