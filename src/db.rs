//! Local SQLite store for the sync core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations for the mutation
//! queue and dispatch tables, plus one generic record table per registered
//! entity kind. The connection is wrapped in a mutex and shared between the
//! UI-facing call sites and the background synchronizer.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::registry::{KindRegistry, KindSpec};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Fixed row key for singleton-shaped entity kinds.
pub const SINGLETON_KEY: &str = "singleton";

/// Initialize the database at `{data_dir}/tillsync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("tillsync.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: mutation queue.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- sync_queue (append-only until drained)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_kind TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            next_retry_at TEXT,
            retry_delay_ms INTEGER NOT NULL DEFAULT 5000,
            enqueued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_kind ON sync_queue(entity_kind);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })
}

/// Migration v2: sale dispatch tables.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- sales (line items stored as a JSON array)
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            items TEXT NOT NULL DEFAULT '[]',
            dispatch_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- stock counters, one row per stock-tracked product
        CREATE TABLE IF NOT EXISTS stock_levels (
            stock_id TEXT PRIMARY KEY,
            quantity INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sales_dispatch_status ON sales(dispatch_status);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })
}

// ---------------------------------------------------------------------------
// Entity record tables
// ---------------------------------------------------------------------------

/// Create the `records_{kind}` table for every registered entity kind.
/// Idempotent; kind names are validated at registry construction, so they
/// are safe to splice into DDL.
pub fn ensure_entity_tables(db: &DbState, registry: &KindRegistry) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    for spec in registry.iter() {
        let table = spec.table_name();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                confirmed INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );"
        ))
        .map_err(|e| format!("create {table}: {e}"))?;
    }
    Ok(())
}

/// Upsert a single record inside an existing transaction or connection.
///
/// `confirmed` applies only when the row is first inserted; a conflicting
/// upsert keeps the existing confirmation flag so a local update does not
/// spuriously mark a temp-id record as server-confirmed.
pub(crate) fn put_record_tx(
    conn: &Connection,
    spec: &KindSpec,
    id: &str,
    data: &Value,
    confirmed: bool,
) -> Result<(), String> {
    let table = spec.table_name();
    let json = serde_json::to_string(data).map_err(|e| format!("serialize {table} record: {e}"))?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, data, confirmed, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at"
        ),
        params![id, json, confirmed as i64],
    )
    .map_err(|e| format!("upsert {table}[{id}]: {e}"))?;
    Ok(())
}

/// Upsert a single record.
pub fn put_record(
    db: &DbState,
    spec: &KindSpec,
    id: &str,
    data: &Value,
    confirmed: bool,
) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    put_record_tx(&conn, spec, id, data, confirmed)
}

/// Bulk-upsert server records in a single transaction. Marks every written
/// row as confirmed, since the data came from the remote store.
pub fn bulk_put_records(
    db: &DbState,
    spec: &KindSpec,
    records: &[(String, Value)],
) -> Result<usize, String> {
    if records.is_empty() {
        return Ok(0);
    }

    let table = spec.table_name();
    let mut conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tx = conn
        .transaction()
        .map_err(|e| format!("begin bulk put: {e}"))?;

    let mut written = 0;
    {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {table} (id, data, confirmed, updated_at)
                 VALUES (?1, ?2, 1, datetime('now'))
                 ON CONFLICT(id) DO UPDATE SET
                    data = excluded.data,
                    confirmed = 1,
                    updated_at = excluded.updated_at"
            ))
            .map_err(|e| format!("prepare bulk put: {e}"))?;

        for (id, data) in records {
            let json = serde_json::to_string(data)
                .map_err(|e| format!("serialize {table} record: {e}"))?;
            stmt.execute(params![id, json])
                .map_err(|e| format!("upsert {table}[{id}]: {e}"))?;
            written += 1;
        }
    }

    tx.commit().map_err(|e| format!("commit bulk put: {e}"))?;
    Ok(written)
}

/// Fetch one record by id, or `None` when absent or unparsable.
pub fn get_record(db: &DbState, spec: &KindSpec, id: &str) -> Result<Option<Value>, String> {
    let table = spec.table_name();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let json: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("get {table}[{id}]: {e}"))?;

    match json {
        Some(s) => match serde_json::from_str(&s) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                error!("{table}[{id}] JSON parse error: {e}");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Delete one record by id. Returns whether a row was removed.
pub fn delete_record(db: &DbState, spec: &KindSpec, id: &str) -> Result<bool, String> {
    let table = spec.table_name();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let removed = conn
        .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
        .map_err(|e| format!("delete {table}[{id}]: {e}"))?;
    Ok(removed > 0)
}

/// Count records in a kind's table.
pub fn count_records(db: &DbState, spec: &KindSpec) -> Result<i64, String> {
    let table = spec.table_name();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("count {table}: {e}"))
}

/// List all records for a kind, most recently written first.
pub fn list_records(db: &DbState, spec: &KindSpec) -> Result<Vec<Value>, String> {
    let table = spec.table_name();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, data FROM {table} ORDER BY updated_at DESC, id ASC"
        ))
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let data: String = row.get(1)?;
            Ok((id, data))
        })
        .map_err(|e| e.to_string())?;

    let mut records = Vec::new();
    for row in rows {
        match row {
            Ok((id, data)) => match serde_json::from_str(&data) {
                Ok(value) => records.push(value),
                Err(e) => warn!("skipping malformed {table} row {id}: {e}"),
            },
            Err(e) => warn!("skipping unreadable {table} row: {e}"),
        }
    }
    Ok(records)
}
