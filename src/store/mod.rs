mod records;
pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::LifecycleState;

pub use records::{Batch, Bottle, SoldEvent, TransportEvent};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite record store. Write transactions own `conn` for a whole ingest run.
/// File-backed stores also keep a read-only `reader`, which in WAL mode sees
/// the last committed state while a run is in flight.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
    reader: Option<Arc<Mutex<Connection>>>,
}

impl RecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening record store at {}", path.display());

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        schema::init_schema(&conn)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        let mut store = Self::from_connection(conn);
        store.reader = Some(Arc::new(Mutex::new(reader)));
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory record store");

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;

        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            reader: None,
        }
    }

    /// Start a write transaction. Dropping the returned handle without
    /// committing rolls it back.
    pub async fn begin(&self) -> Result<StoreTx> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(StoreTx { conn, finished: false })
    }

    /// Run `f` against the write connection outside any workflow transaction.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.reader.as_ref().unwrap_or(&self.conn).lock().await;
        f(&conn)
    }

    pub async fn bottle(&self, id: &str) -> Result<Option<Bottle>> {
        self.read(|c| records::get_bottle(c, id)).await
    }

    pub async fn batch(&self, id: i64) -> Result<Option<Batch>> {
        self.read(|c| records::get_batch(c, id)).await
    }

    pub async fn bottle_ids(&self) -> Result<Vec<String>> {
        self.read(records::list_bottle_ids).await
    }

    pub async fn latest_milestone(&self, bottle_id: &str) -> Result<Option<TransportEvent>> {
        self.read(|c| records::get_latest_milestone(c, bottle_id)).await
    }

    pub async fn milestone_at(&self, bottle_id: &str, ts: i64) -> Result<Option<TransportEvent>> {
        self.read(|c| records::get_milestone_at(c, bottle_id, ts)).await
    }

    pub async fn transport_events(&self, bottle_id: &str) -> Result<Vec<TransportEvent>> {
        self.read(|c| records::list_transport_events(c, bottle_id)).await
    }

    pub async fn sold_event(&self, bottle_id: &str) -> Result<Option<SoldEvent>> {
        self.read(|c| records::get_sold_event(c, bottle_id)).await
    }
}

/// An open write transaction on the record store.
pub struct StoreTx {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

impl StoreTx {
    pub fn batch(&self, id: i64) -> Result<Option<Batch>> {
        records::get_batch(&self.conn, id)
    }

    pub fn insert_batch(&self, batch: &Batch) -> Result<()> {
        records::insert_batch(&self.conn, batch)
    }

    pub fn bottle(&self, id: &str) -> Result<Option<Bottle>> {
        records::get_bottle(&self.conn, id)
    }

    pub fn insert_bottle(&self, bottle: &Bottle) -> Result<()> {
        records::insert_bottle(&self.conn, bottle)
    }

    pub fn set_status(&self, bottle_id: &str, status: LifecycleState) -> Result<()> {
        records::update_bottle_status(&self.conn, bottle_id, status)
    }

    pub fn milestone_at(&self, bottle_id: &str, ts: i64) -> Result<Option<TransportEvent>> {
        records::get_milestone_at(&self.conn, bottle_id, ts)
    }

    pub fn insert_transport_event(
        &self,
        bottle_id: &str,
        location: &str,
        status: &str,
        ts: i64,
        is_milestone: i64,
        temperature: Option<f64>,
    ) -> Result<i64> {
        records::insert_transport_event(&self.conn, bottle_id, location, status, ts, is_milestone, temperature)
    }

    pub fn sold_event(&self, bottle_id: &str) -> Result<Option<SoldEvent>> {
        records::get_sold_event(&self.conn, bottle_id)
    }

    pub fn insert_sold_event(&self, bottle_id: &str, store: &str, ts: i64) -> Result<i64> {
        records::insert_sold_event(&self.conn, bottle_id, store, ts)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("rollback on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(id: i64) -> Batch {
        Batch {
            id,
            winery_code: Some("CHX".into()),
            vintage: Some(2019),
            harvest_year: Some(2019),
            variety: Some("Merlot".into()),
            vineyard: None,
        }
    }

    fn bottle(id: &str) -> Bottle {
        Bottle {
            id: id.into(),
            batch_id: 1,
            current_status: LifecycleState::Produced,
            retailer: String::new(),
            bottle_key: crate::keys::bottle_key(id).to_hex(),
            submission_json: format!(r#"{{"id":"{}"}}"#, id),
        }
    }

    #[tokio::test]
    async fn test_commit_persists_rows() {
        let store = RecordStore::open_in_memory().unwrap();
        let tx = store.begin().await.unwrap();
        tx.insert_batch(&batch(1)).unwrap();
        tx.insert_bottle(&bottle("b1")).unwrap();
        tx.commit().unwrap();

        let found = store.bottle("b1").await.unwrap().unwrap();
        assert_eq!(found.current_status, LifecycleState::Produced);
        assert_eq!(store.batch(1).await.unwrap(), Some(batch(1)));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = RecordStore::open_in_memory().unwrap();
        {
            let tx = store.begin().await.unwrap();
            tx.insert_batch(&batch(1)).unwrap();
        }
        assert!(store.batch(1).await.unwrap().is_none());

        let tx = store.begin().await.unwrap();
        tx.insert_batch(&batch(1)).unwrap();
        tx.rollback().unwrap();
        assert!(store.batch(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_milestone_ignores_plain_events() {
        let store = RecordStore::open_in_memory().unwrap();
        let tx = store.begin().await.unwrap();
        tx.insert_batch(&batch(1)).unwrap();
        tx.insert_bottle(&bottle("b1")).unwrap();
        tx.insert_transport_event("b1", "Lyon", "in-transit", 100, 1, Some(12.0)).unwrap();
        tx.insert_transport_event("b1", "Macon", "checkpoint", 200, 0, None).unwrap();
        tx.commit().unwrap();

        let latest = store.latest_milestone("b1").await.unwrap().unwrap();
        assert_eq!(latest.location, "Lyon");
        assert_eq!(store.transport_events("b1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_sold_event_per_bottle() {
        let store = RecordStore::open_in_memory().unwrap();
        let tx = store.begin().await.unwrap();
        tx.insert_batch(&batch(1)).unwrap();
        tx.insert_bottle(&bottle("b1")).unwrap();
        tx.insert_sold_event("b1", "Paris-5", 10).unwrap();
        assert!(tx.insert_sold_event("b1", "Paris-6", 11).is_err());
    }

    #[tokio::test]
    async fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winetrace.db");
        {
            let store = RecordStore::open(&path).unwrap();
            let tx = store.begin().await.unwrap();
            tx.insert_batch(&batch(7)).unwrap();
            tx.commit().unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        assert_eq!(store.batch(7).await.unwrap().map(|b| b.id), Some(7));
    }

    #[tokio::test]
    async fn test_file_store_reads_while_run_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("winetrace.db")).unwrap();

        let tx = store.begin().await.unwrap();
        tx.insert_batch(&batch(1)).unwrap();
        tx.insert_bottle(&bottle("b1")).unwrap();

        let during = tokio::time::timeout(Duration::from_secs(1), store.bottle("b1"))
            .await
            .expect("read blocked behind the open transaction")
            .unwrap();
        assert!(during.is_none());

        tx.commit().unwrap();
        assert!(store.bottle("b1").await.unwrap().is_some());
        assert_eq!(store.bottle_ids().await.unwrap(), vec!["b1".to_string()]);
    }
}
