//! Shared test fixtures: in-memory databases and a scripted remote double.

use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::db::{self, DbState};
use crate::registry::KindRegistry;
use crate::remote::{
    BatchItemResult, BatchItemStatus, BatchOp, BatchResponse, DispatchItem, Operation, RemoteStore,
};

/// Fresh in-memory database with all migrations applied.
pub fn test_db() -> DbState {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    db::run_migrations(&conn).unwrap();
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

/// In-memory database with record tables for every registered kind.
pub fn test_db_with_registry(registry: &KindRegistry) -> DbState {
    let db = test_db();
    db::ensure_entity_tables(&db, registry).unwrap();
    db
}

pub fn test_db_with_registry_arc(registry: &KindRegistry) -> Arc<DbState> {
    Arc::new(test_db_with_registry(registry))
}

pub fn fulfilled(operation: Operation, data: Value) -> BatchItemResult {
    BatchItemResult {
        status: BatchItemStatus::Fulfilled,
        operation,
        data: Some(data),
        reason: None,
    }
}

pub fn rejected(operation: Operation, reason: &str) -> BatchItemResult {
    BatchItemResult {
        status: BatchItemStatus::Rejected,
        operation,
        data: None,
        reason: Some(reason.to_string()),
    }
}

/// Scripted [`RemoteStore`] double.
///
/// Defaults: online, every pushed batch comes back all-fulfilled with the
/// sent data echoed, pulls fail (no data scripted), dispatches echo a
/// minimal updated sale. Tests override behavior per kind or per sale.
pub struct MockRemote {
    online: AtomicBool,
    pull_data: Mutex<HashMap<String, Value>>,
    pull_calls: Mutex<HashMap<String, usize>>,
    pushes: Mutex<Vec<(String, Vec<BatchOp>)>>,
    push_scripts: Mutex<HashMap<String, Result<BatchResponse, String>>>,
    offline_after_push: Mutex<Option<String>>,
    dispatch_scripts: Mutex<HashMap<String, Result<Value, String>>>,
    dispatches: Mutex<Vec<(String, Vec<DispatchItem>)>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            pull_data: Mutex::new(HashMap::new()),
            pull_calls: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            push_scripts: Mutex::new(HashMap::new()),
            offline_after_push: Mutex::new(None),
            dispatch_scripts: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_pull_data(&self, kind: &str, data: Value) {
        self.pull_data
            .lock()
            .unwrap()
            .insert(kind.to_string(), data);
    }

    pub fn pull_calls(&self, kind: &str) -> usize {
        self.pull_calls
            .lock()
            .unwrap()
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn script_push_response(&self, kind: &str, response: Result<BatchResponse, String>) {
        self.push_scripts
            .lock()
            .unwrap()
            .insert(kind.to_string(), response);
    }

    /// Drop the connection right after the batch for `kind` is answered.
    pub fn go_offline_after_push(&self, kind: &str) {
        *self.offline_after_push.lock().unwrap() = Some(kind.to_string());
    }

    pub fn pushes(&self) -> Vec<(String, Vec<BatchOp>)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn script_dispatch(&self, sale_id: &str, response: Result<Value, String>) {
        self.dispatch_scripts
            .lock()
            .unwrap()
            .insert(sale_id.to_string(), response);
    }

    pub fn dispatches(&self) -> Vec<(String, Vec<DispatchItem>)> {
        self.dispatches.lock().unwrap().clone()
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MockRemote {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn pull(&self, kind: &str) -> Result<Value, String> {
        *self
            .pull_calls
            .lock()
            .unwrap()
            .entry(kind.to_string())
            .or_insert(0) += 1;

        if !self.online.load(Ordering::SeqCst) {
            return Err("remote unreachable".to_string());
        }
        self.pull_data
            .lock()
            .unwrap()
            .get(kind)
            .cloned()
            .ok_or_else(|| format!("connection refused pulling '{kind}'"))
    }

    async fn push_batch(&self, kind: &str, ops: Vec<BatchOp>) -> Result<BatchResponse, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("remote unreachable".to_string());
        }

        self.pushes
            .lock()
            .unwrap()
            .push((kind.to_string(), ops.clone()));

        if self.offline_after_push.lock().unwrap().as_deref() == Some(kind) {
            self.online.store(false, Ordering::SeqCst);
        }

        if let Some(scripted) = self.push_scripts.lock().unwrap().get(kind) {
            return scripted.clone();
        }

        Ok(BatchResponse {
            success: true,
            results: ops
                .iter()
                .map(|op| fulfilled(op.operation, op.data.clone()))
                .collect(),
        })
    }

    async fn dispatch(&self, sale_id: &str, items: Vec<DispatchItem>) -> Result<Value, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("remote unreachable".to_string());
        }

        self.dispatches
            .lock()
            .unwrap()
            .push((sale_id.to_string(), items));

        if let Some(scripted) = self.dispatch_scripts.lock().unwrap().get(sale_id) {
            return scripted.clone();
        }
        Ok(serde_json::json!({
            "id": sale_id,
            "dispatchStatus": "dispatched"
        }))
    }
}
