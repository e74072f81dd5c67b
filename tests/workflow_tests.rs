use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use winetrace::{
    bottle_key, canonicalize, row_key, AuditVerifier, BatchSubmission, CheckOutcome, IngestWorkflow,
    LedgerCall, LedgerClient, LifecycleState, MemoryLedger, RecordStore, Reconciler, Reconciliation, Stage,
    TraceError, WriteOutcome,
};

const BOTTLE: &str = "coco1514";

struct Harness {
    ledger: Arc<MemoryLedger>,
    client: Arc<LedgerClient>,
    store: RecordStore,
    workflow: IngestWorkflow,
    verifier: AuditVerifier,
}

fn harness() -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let client = Arc::new(LedgerClient::new(ledger.clone(), Duration::from_secs(5)));
    let store = RecordStore::open_in_memory().unwrap();
    let workflow = IngestWorkflow::new(store.clone(), client.clone()).with_read_back_attempts(2);
    let verifier = AuditVerifier::new(store.clone(), client.clone());
    Harness { ledger, client, store, workflow, verifier }
}

fn fixture(name: &str) -> Map<String, Value> {
    let raw = std::fs::read_to_string(Path::new("tests/fixtures").join(name)).unwrap();
    serde_json::from_str::<Value>(&raw).unwrap().as_object().cloned().unwrap()
}

fn batch() -> BatchSubmission {
    serde_json::from_value(Value::Object(fixture("batch.json"))).unwrap()
}

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

async fn produce(h: &Harness) {
    h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap();
}

async fn produce_and_ship(h: &Harness) {
    produce(h).await;
    h.workflow.ship(BOTTLE, &fixture("ship_lyon.json")).await.unwrap();
}

async fn full_lifecycle(h: &Harness) {
    produce_and_ship(h).await;
    h.workflow.deliver(&fixture("deliver_paris.json")).await.unwrap();
}

#[tokio::test]
async fn test_produce_anchors_submission_as_received() {
    let h = harness();
    let receipt = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap();

    let proof = receipt.anchor.unwrap();
    assert_eq!(
        proof.canonical_json,
        r#"{"id":"coco1514","batch_id":1,"current_status":"Produced","retailer":"","vineyard":"Ch\u00e2teau Margaux"}"#
    );
    assert_eq!(
        proof.row_hash.to_hex(),
        "0x8827e20e3da6726dcf30b023191cfb414362cf57264829ab77b8ee68335a2c91"
    );
    assert!(proof.transition_tx.is_some());
    assert!(proof.anchor_tx.is_some());

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    assert_eq!(report.outcome(Stage::Produce), Some(CheckOutcome::Match));
    assert_eq!(report.outcome(Stage::Ship), Some(CheckOutcome::Missing));
    assert_eq!(report.outcome(Stage::Deliver), Some(CheckOutcome::Missing));
    assert_eq!(report.ledger_state, LifecycleState::Produced);
    assert!(report.detail.is_none());
}

#[tokio::test]
async fn test_ship_milestone_matches_and_plain_event_is_not_flagged() {
    let h = harness();
    produce(&h).await;

    let receipt = h.workflow.ship(BOTTLE, &fixture("ship_lyon.json")).await.unwrap();
    let proof = receipt.anchor.unwrap();
    assert_eq!(
        proof.row_hash.to_hex(),
        "0x6cb4b0d308537113c94d9da0b42885c31a00bf07c81eb931fb28783b0c504619"
    );

    let tx_before = h.ledger.transaction_total();
    let plain = h.workflow.ship(BOTTLE, &fixture("ship_checkpoint.json")).await.unwrap();
    assert!(plain.anchor.is_none());
    assert_eq!(h.ledger.transaction_total(), tx_before);
    assert_eq!(h.store.transport_events(BOTTLE).await.unwrap().len(), 2);

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    let ship = report.check(Stage::Ship).unwrap();
    assert_eq!(ship.outcome, CheckOutcome::Match);
    assert_eq!(ship.ts, Some(1700000000));
    assert_eq!(report.ledger_state, LifecycleState::InTransit);
    assert_eq!(report.local_status, Some(LifecycleState::InTransit));
}

#[tokio::test]
async fn test_deliver_completes_lifecycle_with_detail_dump() {
    let h = harness();
    produce_and_ship(&h).await;

    let receipt = h.workflow.deliver(&fixture("deliver_paris.json")).await.unwrap();
    assert_eq!(
        receipt.anchor.unwrap().row_hash.to_hex(),
        "0x11348c999f1f4db4403e9a3e6604d6e1320b8938321df46938f13dfa7e9b139c"
    );

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    assert!(report.all_match());
    assert_eq!(report.ledger_state, LifecycleState::Delivered);

    let detail = report.detail.unwrap();
    assert_eq!(detail.bottle.current_status, LifecycleState::Delivered);
    assert_eq!(detail.batch.unwrap().id, 1);
    assert_eq!(detail.transport_events.len(), 1);
    assert_eq!(detail.sold_event.unwrap().store, "Paris-5");
}

#[tokio::test]
async fn test_tampered_sale_is_reported_as_mismatch() {
    let h = harness();
    full_lifecycle(&h).await;

    let key = row_key(Stage::Deliver, BOTTLE, Some(1700050000)).unwrap();
    let anchored = h.ledger.anchor(&key).unwrap();

    h.store
        .with_conn(|c| {
            c.execute("UPDATE sold_event SET store = 'Paris-6' WHERE bottle_id = ?1", [BOTTLE])?;
            Ok(())
        })
        .await
        .unwrap();

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    assert_eq!(report.outcome(Stage::Deliver), Some(CheckOutcome::Mismatch));
    assert_eq!(report.outcome(Stage::Produce), Some(CheckOutcome::Match));
    assert_eq!(report.outcome(Stage::Ship), Some(CheckOutcome::Match));
    assert!(report.detail.is_none());

    assert_eq!(h.ledger.anchor(&key), Some(anchored));
    assert_eq!(h.ledger.lifecycle(&bottle_key(BOTTLE)), LifecycleState::Delivered);
}

#[tokio::test]
async fn test_failed_read_back_is_partial_commit_and_reconcilable() {
    let h = harness();
    h.ledger.faults(|f| f.failed_reads_after_store = 10);

    let err = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap_err();
    let partial = err.as_partial_commit().cloned().unwrap();
    assert!(!err.is_retryable());
    assert_eq!(partial.stage, Stage::Produce);
    assert_eq!(partial.bottle_id, BOTTLE);
    assert_eq!(partial.lifecycle, WriteOutcome::Landed);
    assert_eq!(partial.anchor, WriteOutcome::Landed);

    assert!(h.store.bottle(BOTTLE).await.unwrap().is_none());
    assert!(h.store.batch(1).await.unwrap().is_none());

    h.ledger.clear_faults();
    let reconciler = Reconciler::new(h.store.clone(), h.client.clone());
    let report = reconciler.reconcile_partial(&partial).await.unwrap();
    assert_eq!(report.classification, Reconciliation::LedgerAhead);
    assert_eq!(report.row_key, partial.row_key);
    assert_eq!(report.ledger_hash, Some(partial.expected_hash));
    assert_eq!(report.ledger_state, LifecycleState::Produced);
    assert_eq!(report.local_state, None);
}

#[tokio::test]
async fn test_lost_store_hash_receipt_is_confirmed_by_read_back() {
    let h = harness();
    h.ledger.faults(|f| {
        f.lost_receipts = 1;
        f.only_call = Some("storeHash");
    });

    let receipt = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap();
    let proof = receipt.anchor.unwrap();
    assert!(proof.anchor_tx.is_none());
    assert!(proof.transition_tx.is_some());

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    assert_eq!(report.outcome(Stage::Produce), Some(CheckOutcome::Match));
}

#[tokio::test]
async fn test_lost_transition_receipt_is_confirmed_by_status() {
    let h = harness();
    h.ledger.faults(|f| {
        f.lost_receipts = 1;
        f.only_call = Some("produce");
    });

    let receipt = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap();
    let proof = receipt.anchor.unwrap();
    assert!(proof.transition_tx.is_none());
    assert!(proof.anchor_tx.is_some());
    assert_eq!(h.ledger.lifecycle(&bottle_key(BOTTLE)), LifecycleState::Produced);
}

#[tokio::test]
async fn test_unreachable_anchor_without_transition_rolls_back_cleanly() {
    let h = harness();
    produce_and_ship(&h).await;

    h.ledger.faults(|f| {
        f.refused_submits = 1;
        f.only_call = Some("storeHash");
    });
    let second = obj(json!({"location": "Dijon", "status": "in-transit", "ts": 1700030000, "is_milestone": 1}));

    let err = h.workflow.ship(BOTTLE, &second).await.unwrap_err();
    assert!(matches!(err, TraceError::AnchorUnavailable(_)));
    assert!(err.is_retryable());
    assert!(h.store.milestone_at(BOTTLE, 1700030000).await.unwrap().is_none());

    let retried = h.workflow.ship(BOTTLE, &second).await.unwrap();
    let proof = retried.anchor.unwrap();
    assert!(proof.transition_tx.is_none());
    assert_eq!(h.ledger.lifecycle(&bottle_key(BOTTLE)), LifecycleState::InTransit);

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    let ship = report.check(Stage::Ship).unwrap();
    assert_eq!(ship.ts, Some(1700030000));
    assert_eq!(ship.outcome, CheckOutcome::Match);
}

#[tokio::test]
async fn test_unreachable_anchor_after_transition_is_partial_commit() {
    let h = harness();
    h.ledger.faults(|f| {
        f.refused_submits = 1;
        f.only_call = Some("storeHash");
    });

    let err = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap_err();
    let partial = err.as_partial_commit().unwrap();
    assert_eq!(partial.lifecycle, WriteOutcome::Landed);
    assert_eq!(partial.anchor, WriteOutcome::Failed);
    assert!(h.store.bottle(BOTTLE).await.unwrap().is_none());

    let reconciler = Reconciler::new(h.store.clone(), h.client.clone());
    let report = reconciler.reconcile(Stage::Produce, BOTTLE, None).await.unwrap();
    assert_eq!(report.ledger_hash, None);
    assert_eq!(report.classification, Reconciliation::LedgerAhead);
}

#[tokio::test]
async fn test_ledger_rejects_out_of_order_transition() {
    let h = harness();
    h.client.send(LedgerCall::Produce(bottle_key(BOTTLE))).await.unwrap();

    let err = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap_err();
    match err {
        TraceError::InvalidTransition { stage, state, .. } => {
            assert_eq!(stage, Stage::Produce);
            assert_eq!(state, LifecycleState::Produced);
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }

    assert!(h.store.bottle(BOTTLE).await.unwrap().is_none());
    let key = row_key(Stage::Produce, BOTTLE, None).unwrap();
    assert!(h.ledger.anchor(&key).is_none());
}

#[tokio::test]
async fn test_key_bound_to_other_hash_fails_before_ledger_mutation() {
    let h = harness();
    let key = row_key(Stage::Produce, BOTTLE, None).unwrap();
    let foreign = winetrace::content_hash(b"something else");
    h.client.send(LedgerCall::StoreHash { key, hash: foreign }).await.unwrap();

    let err = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap_err();
    assert!(matches!(err, TraceError::AnchorWrite { .. }));
    assert_eq!(h.ledger.lifecycle(&bottle_key(BOTTLE)), LifecycleState::None);
    assert_eq!(h.ledger.anchor(&key), Some(foreign));
    assert!(h.store.bottle(BOTTLE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_local_preconditions_are_validation_errors() {
    let h = harness();

    let err = h.workflow.ship(BOTTLE, &fixture("ship_lyon.json")).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    produce(&h).await;

    let err = h.workflow.produce(&batch(), &fixture("bottle.json")).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    let err = h.workflow.deliver(&fixture("deliver_paris.json")).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    let foreign = obj(json!({"location": "Lyon", "status": "in-transit", "ts": 1, "is_milestone": 1, "bottle_id": "other"}));
    let err = h.workflow.ship(BOTTLE, &foreign).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    h.workflow.ship(BOTTLE, &fixture("ship_lyon.json")).await.unwrap();
    let err = h.workflow.ship(BOTTLE, &fixture("ship_lyon.json")).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    h.workflow.deliver(&fixture("deliver_paris.json")).await.unwrap();
    let err = h.workflow.deliver(&fixture("deliver_paris.json")).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    let late = obj(json!({"location": "Paris", "status": "returned", "ts": 1700090000, "is_milestone": 0}));
    let err = h.workflow.ship(BOTTLE, &late).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));
}

#[tokio::test]
async fn test_batch_reuse_and_conflict() {
    let h = harness();
    produce(&h).await;

    let second = obj(json!({"id": "coco1515", "batch_id": 1}));
    h.workflow.produce(&batch(), &second).await.unwrap();

    let mut altered = batch();
    altered.variety = Some("Merlot".into());
    let third = obj(json!({"id": "coco1516", "batch_id": 1}));
    let err = h.workflow.produce(&altered, &third).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));
    assert!(h.store.bottle("coco1516").await.unwrap().is_none());

    assert_eq!(h.store.bottle_ids().await.unwrap(), vec!["coco1514".to_string(), "coco1515".to_string()]);
}

#[tokio::test]
async fn test_concurrent_milestones_for_one_bottle_transition_once() {
    let h = harness();
    produce(&h).await;

    let a = obj(json!({"location": "Lyon", "status": "in-transit", "ts": 1700000000, "is_milestone": 1}));
    let b = obj(json!({"location": "Dijon", "status": "in-transit", "ts": 1700010000, "is_milestone": 1}));

    let (ra, rb) = tokio::join!(h.workflow.ship(BOTTLE, &a), h.workflow.ship(BOTTLE, &b));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let transitions = [ra, rb]
        .iter()
        .filter(|r| r.anchor.as_ref().is_some_and(|p| p.transition_tx.is_some()))
        .count();
    assert_eq!(transitions, 1);
    assert_eq!(h.ledger.lifecycle(&bottle_key(BOTTLE)), LifecycleState::InTransit);

    for ts in [1700000000, 1700010000] {
        assert!(h.ledger.anchor(&row_key(Stage::Ship, BOTTLE, Some(ts)).unwrap()).is_some());
    }
}

#[tokio::test]
async fn test_concurrent_bottles_do_not_interfere() {
    let h = harness();
    let b1 = obj(json!({"id": "b-1", "batch_id": 1}));
    let b2 = obj(json!({"id": "b-2", "batch_id": 1}));
    let batch = batch();

    let (r1, r2) = tokio::join!(h.workflow.produce(&batch, &b1), h.workflow.produce(&batch, &b2));
    r1.unwrap();
    r2.unwrap();

    for id in ["b-1", "b-2"] {
        let report = h.verifier.verify(id).await.unwrap();
        assert_eq!(report.outcome(Stage::Produce), Some(CheckOutcome::Match));
    }
}

#[tokio::test]
async fn test_hash_without_lifecycle_is_state_hash_divergence() {
    let h = harness();
    produce(&h).await;

    h.store
        .with_conn(|c| {
            c.execute(
                "INSERT INTO transport_event (bottle_id, location, status, ts, is_milestone) VALUES (?1, 'Lyon', 'in-transit', 1700000000, 1)",
                [BOTTLE],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let record = canonicalize(Stage::Ship, &fixture("ship_lyon.json")).unwrap();
    let key = row_key(Stage::Ship, BOTTLE, Some(1700000000)).unwrap();
    h.client
        .send(LedgerCall::StoreHash { key, hash: record.content_hash() })
        .await
        .unwrap();

    let report = h.verifier.verify(BOTTLE).await.unwrap();
    assert_eq!(report.outcome(Stage::Ship), Some(CheckOutcome::StateHashDivergence));
    assert_eq!(report.divergences().len(), 1);
    assert_eq!(report.ledger_state, LifecycleState::Produced);
}

#[tokio::test]
async fn test_diagnose_pinpoints_tampered_field() {
    let h = harness();
    full_lifecycle(&h).await;

    let produce = h.verifier.diagnose(Stage::Produce, BOTTLE, &fixture("bottle.json")).await.unwrap();
    assert!(produce.file_matches_ledger());
    assert!(produce.store_matches_ledger());
    assert!(produce.diff().is_none());
    assert_ne!(produce.row_hash, Some(produce.file_hash));

    h.store
        .with_conn(|c| {
            c.execute("UPDATE sold_event SET store = 'Paris-6' WHERE bottle_id = ?1", [BOTTLE])?;
            Ok(())
        })
        .await
        .unwrap();

    let deliver = h.verifier.diagnose(Stage::Deliver, BOTTLE, &fixture("deliver_paris.json")).await.unwrap();
    assert!(deliver.file_matches_ledger());
    assert!(!deliver.store_matches_ledger());
    let diff = deliver.diff().unwrap();
    assert!(diff.contains("Paris-5"));
    assert!(diff.contains("Paris-6"));
    assert!(deliver.row_json.unwrap().contains("\"id\":"));
}

#[tokio::test]
async fn test_verify_unknown_bottle_reports_missing() {
    let h = harness();
    let report = h.verifier.verify("nope").await.unwrap();
    assert!(report.checks.iter().all(|c| c.outcome == CheckOutcome::Missing));
    assert_eq!(report.ledger_state, LifecycleState::None);
    assert_eq!(report.local_status, None);
}
