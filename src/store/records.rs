use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tabled::Tabled;

use crate::error::{Result, TraceError};
use crate::ledger::LifecycleState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Tabled)]
pub struct Batch {
    pub id: i64,
    #[tabled(display = "display_opt")]
    pub winery_code: Option<String>,
    #[tabled(display = "display_opt")]
    pub vintage: Option<i64>,
    #[tabled(display = "display_opt")]
    pub harvest_year: Option<i64>,
    #[tabled(display = "display_opt")]
    pub variety: Option<String>,
    #[tabled(display = "display_opt")]
    pub vineyard: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Tabled)]
pub struct Bottle {
    pub id: String,
    pub batch_id: i64,
    pub current_status: LifecycleState,
    pub retailer: String,
    pub bottle_key: String,
    #[tabled(skip)]
    pub submission_json: String,
}

impl Bottle {
    /// The bottle object as it was submitted at produce time, key order intact.
    pub fn submission(&self) -> Result<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.submission_json)? {
            Value::Object(map) => Ok(map),
            other => Err(TraceError::Canonical(format!(
                "submission snapshot for bottle '{}' is not an object: {}",
                self.id, other
            ))),
        }
    }

    /// Every stored column, as a reader of the table would see it.
    pub fn row_map(&self) -> Map<String, Value> {
        object(json!({
            "id": self.id,
            "batch_id": self.batch_id,
            "current_status": self.current_status.as_str(),
            "retailer": self.retailer,
            "bottle_key": self.bottle_key,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Tabled)]
pub struct TransportEvent {
    pub id: i64,
    pub bottle_id: String,
    pub location: String,
    pub status: String,
    pub ts: i64,
    pub is_milestone: i64,
    #[tabled(display = "display_opt")]
    pub temperature: Option<f64>,
}

impl TransportEvent {
    pub fn milestone(&self) -> bool {
        self.is_milestone == 1
    }

    pub fn row_map(&self) -> Map<String, Value> {
        object(json!({
            "id": self.id,
            "bottle_id": self.bottle_id,
            "location": self.location,
            "status": self.status,
            "ts": self.ts,
            "is_milestone": self.is_milestone,
            "temperature": self.temperature,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Tabled)]
pub struct SoldEvent {
    pub id: i64,
    pub bottle_id: String,
    pub store: String,
    pub ts: i64,
}

impl SoldEvent {
    pub fn row_map(&self) -> Map<String, Value> {
        object(json!({
            "id": self.id,
            "bottle_id": self.bottle_id,
            "store": self.store,
            "ts": self.ts,
        }))
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn display_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

fn status_from_row(row: &Row, idx: usize) -> rusqlite::Result<LifecycleState> {
    let raw: String = row.get(idx)?;
    LifecycleState::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown bottle status '{}'", raw).into(),
        )
    })
}

fn map_batch(row: &Row) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: row.get(0)?,
        winery_code: row.get(1)?,
        vintage: row.get(2)?,
        harvest_year: row.get(3)?,
        variety: row.get(4)?,
        vineyard: row.get(5)?,
    })
}

fn map_bottle(row: &Row) -> rusqlite::Result<Bottle> {
    Ok(Bottle {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        current_status: status_from_row(row, 2)?,
        retailer: row.get(3)?,
        bottle_key: row.get(4)?,
        submission_json: row.get(5)?,
    })
}

fn map_transport(row: &Row) -> rusqlite::Result<TransportEvent> {
    Ok(TransportEvent {
        id: row.get(0)?,
        bottle_id: row.get(1)?,
        location: row.get(2)?,
        status: row.get(3)?,
        ts: row.get(4)?,
        is_milestone: row.get(5)?,
        temperature: row.get(6)?,
    })
}

fn map_sold(row: &Row) -> rusqlite::Result<SoldEvent> {
    Ok(SoldEvent {
        id: row.get(0)?,
        bottle_id: row.get(1)?,
        store: row.get(2)?,
        ts: row.get(3)?,
    })
}

const BATCH_COLUMNS: &str = "id, winery_code, vintage, harvest_year, variety, vineyard";
const BOTTLE_COLUMNS: &str = "id, batch_id, current_status, retailer, bottle_key, submission_json";
const TRANSPORT_COLUMNS: &str = "id, bottle_id, location, status, ts, is_milestone, temperature";
const SOLD_COLUMNS: &str = "id, bottle_id, store, ts";

pub fn get_batch(conn: &Connection, id: i64) -> Result<Option<Batch>> {
    let sql = format!("SELECT {} FROM batch WHERE id = ?1", BATCH_COLUMNS);
    Ok(conn.query_row(&sql, [id], map_batch).optional()?)
}

pub fn insert_batch(conn: &Connection, batch: &Batch) -> Result<()> {
    conn.execute(
        "INSERT INTO batch (id, winery_code, vintage, harvest_year, variety, vineyard)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            batch.id,
            batch.winery_code,
            batch.vintage,
            batch.harvest_year,
            batch.variety,
            batch.vineyard,
        ],
    )?;
    Ok(())
}

pub fn get_bottle(conn: &Connection, id: &str) -> Result<Option<Bottle>> {
    let sql = format!("SELECT {} FROM bottle WHERE id = ?1", BOTTLE_COLUMNS);
    Ok(conn.query_row(&sql, [id], map_bottle).optional()?)
}

pub fn list_bottle_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM bottle ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

pub fn insert_bottle(conn: &Connection, bottle: &Bottle) -> Result<()> {
    conn.execute(
        "INSERT INTO bottle (id, batch_id, current_status, retailer, bottle_key, submission_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            bottle.id,
            bottle.batch_id,
            bottle.current_status.as_str(),
            bottle.retailer,
            bottle.bottle_key,
            bottle.submission_json,
        ],
    )?;
    Ok(())
}

pub fn update_bottle_status(conn: &Connection, id: &str, status: LifecycleState) -> Result<()> {
    let changed = conn.execute(
        "UPDATE bottle SET current_status = ?1 WHERE id = ?2",
        params![status.as_str(), id],
    )?;
    if changed == 0 {
        return Err(TraceError::Validation(format!("bottle '{}' does not exist", id)));
    }
    Ok(())
}

/// Insert a transport event and return its autoincrement id.
pub fn insert_transport_event(
    conn: &Connection,
    bottle_id: &str,
    location: &str,
    status: &str,
    ts: i64,
    is_milestone: i64,
    temperature: Option<f64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO transport_event (bottle_id, location, status, ts, is_milestone, temperature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![bottle_id, location, status, ts, is_milestone, temperature],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_milestone_at(conn: &Connection, bottle_id: &str, ts: i64) -> Result<Option<TransportEvent>> {
    let sql = format!(
        "SELECT {} FROM transport_event WHERE bottle_id = ?1 AND ts = ?2 AND is_milestone = 1",
        TRANSPORT_COLUMNS
    );
    Ok(conn.query_row(&sql, params![bottle_id, ts], map_transport).optional()?)
}

pub fn get_latest_milestone(conn: &Connection, bottle_id: &str) -> Result<Option<TransportEvent>> {
    let sql = format!(
        "SELECT {} FROM transport_event WHERE bottle_id = ?1 AND is_milestone = 1
         ORDER BY ts DESC, id DESC LIMIT 1",
        TRANSPORT_COLUMNS
    );
    Ok(conn.query_row(&sql, [bottle_id], map_transport).optional()?)
}

pub fn list_transport_events(conn: &Connection, bottle_id: &str) -> Result<Vec<TransportEvent>> {
    let sql = format!(
        "SELECT {} FROM transport_event WHERE bottle_id = ?1 ORDER BY ts, id",
        TRANSPORT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([bottle_id], map_transport)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_sold_event(conn: &Connection, bottle_id: &str, store: &str, ts: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO sold_event (bottle_id, store, ts) VALUES (?1, ?2, ?3)",
        params![bottle_id, store, ts],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_sold_event(conn: &Connection, bottle_id: &str) -> Result<Option<SoldEvent>> {
    let sql = format!("SELECT {} FROM sold_event WHERE bottle_id = ?1 LIMIT 1", SOLD_COLUMNS);
    Ok(conn.query_row(&sql, [bottle_id], map_sold).optional()?)
}
