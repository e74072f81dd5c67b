use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating local store schema v{}", SCHEMA_VERSION);
        conn.execute_batch(TABLES_SCHEMA)?;
        conn.execute_batch(INDEXES_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Upgrading local store schema from v{} to v{}", current_version, SCHEMA_VERSION);
        conn.execute_batch(TABLES_SCHEMA)?;
        conn.execute_batch(INDEXES_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

const TABLES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch (
    id            INTEGER PRIMARY KEY,
    winery_code   TEXT,
    vintage       INTEGER,
    harvest_year  INTEGER,
    variety       TEXT,
    vineyard      TEXT,
    created_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS bottle (
    id               TEXT PRIMARY KEY,
    batch_id         INTEGER NOT NULL REFERENCES batch(id),
    current_status   TEXT NOT NULL,
    retailer         TEXT NOT NULL DEFAULT '',
    bottle_key       TEXT NOT NULL,
    submission_json  TEXT NOT NULL,
    created_at       TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS transport_event (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    bottle_id     TEXT NOT NULL REFERENCES bottle(id),
    location      TEXT NOT NULL,
    status        TEXT NOT NULL,
    ts            INTEGER NOT NULL,
    is_milestone  INTEGER NOT NULL DEFAULT 0 CHECK (is_milestone IN (0, 1)),
    temperature   REAL
);

CREATE TABLE IF NOT EXISTS sold_event (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bottle_id  TEXT NOT NULL UNIQUE REFERENCES bottle(id),
    store      TEXT NOT NULL,
    ts         INTEGER NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_transport_bottle_ts ON transport_event(bottle_id, ts);
CREATE UNIQUE INDEX IF NOT EXISTS idx_transport_milestone
    ON transport_event(bottle_id, ts) WHERE is_milestone = 1;
"#;
