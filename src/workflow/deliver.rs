use serde_json::{Map, Value};
use tracing::{info, Instrument};

use crate::canonical::canonicalize;
use crate::error::{Result, TraceError};
use crate::keys::Stage;
use crate::ledger::LifecycleState;
use super::{abort, new_run_id, validation, AnchorPlan, AnchorProof, IngestReceipt, IngestWorkflow};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliverEvent {
    pub bottle_id: String,
    pub store: String,
    pub ts: i64,
    fields: Map<String, Value>,
}

impl DeliverEvent {
    pub fn from_submission(event: &Map<String, Value>) -> Result<Self> {
        let text = |name: &str| {
            event
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| TraceError::Validation(format!("sale event needs a string '{}'", name)))
        };
        let bottle_id = text("bottle_id")?;
        let store = text("store")?;
        let ts = event
            .get("ts")
            .and_then(Value::as_i64)
            .ok_or_else(|| TraceError::Validation("sale event needs an integer 'ts'".into()))?;

        Ok(Self {
            bottle_id,
            store,
            ts,
            fields: event.clone(),
        })
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl IngestWorkflow {
    /// Record the sale of an in-transit bottle and anchor it.
    pub async fn deliver(&self, event: &Map<String, Value>) -> Result<IngestReceipt> {
        let event = DeliverEvent::from_submission(event)?;
        let run_id = new_run_id();
        let span = tracing::info_span!("deliver", run = %run_id, bottle = %event.bottle_id, ts = event.ts);

        let proof = async {
            let _guard = self.lock_bottle(&event.bottle_id).await;
            self.deliver_locked(&event).await
        }
        .instrument(span)
        .await?;

        Ok(IngestReceipt {
            run_id,
            stage: Stage::Deliver,
            bottle_id: event.bottle_id,
            anchor: Some(proof),
        })
    }

    async fn deliver_locked(&self, event: &DeliverEvent) -> Result<AnchorProof> {
        let tx = self.store.begin().await?;

        let bottle = match tx.bottle(&event.bottle_id)? {
            Some(b) => b,
            None => {
                return Err(abort(
                    tx,
                    TraceError::Validation(format!("bottle '{}' does not exist", event.bottle_id)),
                ));
            }
        };

        if bottle.current_status != LifecycleState::InTransit {
            return Err(abort(
                tx,
                TraceError::Validation(format!(
                    "bottle '{}' is {}, only InTransit bottles can be delivered",
                    bottle.id, bottle.current_status
                )),
            ));
        }

        if let Some(sold) = tx.sold_event(&bottle.id)? {
            return Err(abort(
                tx,
                TraceError::Validation(format!("bottle '{}' was already sold at {}", bottle.id, sold.store)),
            ));
        }

        tx.insert_sold_event(&bottle.id, &event.store, event.ts)?;
        tx.set_status(&bottle.id, LifecycleState::Delivered)?;

        let record = match canonicalize(Stage::Deliver, event.fields()) {
            Ok(record) => record,
            Err(e) => return Err(abort(tx, validation(e))),
        };
        let plan = AnchorPlan::new(Stage::Deliver, &bottle.id, Some(event.ts), record, true)?;
        let proof = self.anchor_and_commit(tx, plan).await?;
        info!("✅ {} sold at {} and anchored", bottle.id, event.store);
        Ok(proof)
    }
}
