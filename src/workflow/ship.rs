use serde_json::{Map, Value};
use tracing::{info, Instrument};

use crate::canonical::canonicalize;
use crate::error::{Result, TraceError};
use crate::keys::Stage;
use crate::ledger::LifecycleState;
use super::{abort, new_run_id, validation, AnchorPlan, AnchorProof, IngestReceipt, IngestWorkflow};

/// A transport event as submitted by the shipper, with `bottle_id` and
/// `is_milestone` filled in when the submission left them out.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipEvent {
    pub bottle_id: String,
    pub location: String,
    pub status: String,
    pub ts: i64,
    pub is_milestone: bool,
    pub temperature: Option<f64>,
    fields: Map<String, Value>,
}

impl ShipEvent {
    pub fn from_submission(bottle_id: &str, event: &Map<String, Value>) -> Result<Self> {
        let mut fields = event.clone();

        match fields.get("bottle_id") {
            None => {
                fields.insert("bottle_id".into(), Value::from(bottle_id));
            }
            Some(Value::String(declared)) if declared == bottle_id => {}
            Some(declared) => {
                return Err(TraceError::Validation(format!(
                    "event bottle_id {} does not match requested bottle '{}'",
                    declared, bottle_id
                )));
            }
        }

        if !fields.contains_key("is_milestone") {
            fields.insert("is_milestone".into(), Value::from(0));
        }

        let location = required_str(&fields, "location")?;
        let status = required_str(&fields, "status")?;
        let ts = fields
            .get("ts")
            .and_then(Value::as_i64)
            .ok_or_else(|| TraceError::Validation("transport event needs an integer 'ts'".into()))?;
        let is_milestone = match fields.get("is_milestone").and_then(Value::as_u64) {
            Some(0) => false,
            Some(1) => true,
            _ => return Err(TraceError::Validation("is_milestone must be 0 or 1".into())),
        };
        let temperature = match fields.get("temperature") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .ok_or_else(|| TraceError::Validation(format!("temperature must be a number, got {}", v)))?,
            ),
        };

        Ok(Self {
            bottle_id: bottle_id.to_string(),
            location,
            status,
            ts,
            is_milestone,
            temperature,
            fields,
        })
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

fn required_str(fields: &Map<String, Value>, name: &str) -> Result<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TraceError::Validation(format!("transport event needs a string '{}'", name)))
}

impl IngestWorkflow {
    /// Record a transport event. Milestones are anchored; other events are
    /// stored locally only.
    pub async fn ship(&self, bottle_id: &str, event: &Map<String, Value>) -> Result<IngestReceipt> {
        let event = ShipEvent::from_submission(bottle_id, event)?;
        let run_id = new_run_id();
        let span = tracing::info_span!("ship", run = %run_id, bottle = %bottle_id, ts = event.ts);

        let anchor = async {
            let _guard = self.lock_bottle(bottle_id).await;
            self.ship_locked(&event).await
        }
        .instrument(span)
        .await?;

        Ok(IngestReceipt {
            run_id,
            stage: Stage::Ship,
            bottle_id: bottle_id.to_string(),
            anchor,
        })
    }

    async fn ship_locked(&self, event: &ShipEvent) -> Result<Option<AnchorProof>> {
        let tx = self.store.begin().await?;

        let bottle = match tx.bottle(&event.bottle_id)? {
            Some(b) => b,
            None => {
                return Err(abort(
                    tx,
                    TraceError::Validation(format!("bottle '{}' does not exist, produce it first", event.bottle_id)),
                ));
            }
        };

        if bottle.current_status == LifecycleState::Delivered {
            return Err(abort(
                tx,
                TraceError::Validation(format!("bottle '{}' is already delivered", bottle.id)),
            ));
        }

        if event.is_milestone && tx.milestone_at(&bottle.id, event.ts)?.is_some() {
            return Err(abort(
                tx,
                TraceError::Validation(format!(
                    "bottle '{}' already has a milestone at ts {}",
                    bottle.id, event.ts
                )),
            ));
        }

        tx.insert_transport_event(
            &bottle.id,
            &event.location,
            &event.status,
            event.ts,
            i64::from(event.is_milestone),
            event.temperature,
        )?;

        if !event.is_milestone {
            tx.commit()?;
            info!("📄 plain transport event stored for {}, not anchored", bottle.id);
            return Ok(None);
        }

        let transition = bottle.current_status == LifecycleState::Produced;
        if transition {
            tx.set_status(&bottle.id, LifecycleState::InTransit)?;
        }

        let record = match canonicalize(Stage::Ship, event.fields()) {
            Ok(record) => record,
            Err(e) => return Err(abort(tx, validation(e))),
        };
        let plan = AnchorPlan::new(Stage::Ship, &bottle.id, Some(event.ts), record, transition)?;
        let proof = self.anchor_and_commit(tx, plan).await?;
        info!("🔗 milestone {} of {} anchored", event.ts, bottle.id);
        Ok(Some(proof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fills_bottle_id_and_milestone() {
        let event = ShipEvent::from_submission(
            "coco1514",
            &obj(json!({"location": "Macon", "status": "checkpoint", "ts": 5})),
        )
        .unwrap();
        assert!(!event.is_milestone);
        assert_eq!(event.fields()["bottle_id"], json!("coco1514"));
        assert_eq!(event.fields()["is_milestone"], json!(0));
    }

    #[test]
    fn test_rejects_foreign_bottle_id() {
        let err = ShipEvent::from_submission(
            "coco1514",
            &obj(json!({"location": "Lyon", "status": "in-transit", "ts": 1, "is_milestone": 1, "bottle_id": "other"})),
        )
        .unwrap_err();
        assert!(matches!(err, TraceError::Validation(_)));
    }

    #[test]
    fn test_rejects_bad_flag_and_ts() {
        let bad_flag = obj(json!({"location": "Lyon", "status": "s", "ts": 1, "is_milestone": 2}));
        assert!(ShipEvent::from_submission("b", &bad_flag).is_err());

        let text_ts = obj(json!({"location": "Lyon", "status": "s", "ts": "1700000000", "is_milestone": 1}));
        assert!(ShipEvent::from_submission("b", &text_ts).is_err());
    }
}
