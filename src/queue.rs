//! Mutation queue.
//!
//! Append-only log of pending create/update/delete intents awaiting remote
//! confirmation. An enqueue performs the optimistic local record write and
//! the queue insert in one transaction, so the two can never diverge. Rows
//! are FIFO within an entity kind; there is no ordering guarantee across
//! kinds because each kind's batch is an independent network round-trip.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::params;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{self, DbState, SINGLETON_KEY};
use crate::registry::{KindRegistry, KindShape};
use crate::remote::Operation;

const MAX_RETRY_DELAY_MS: i64 = 300_000;

/// One pending mutation, as drained from the queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub local_id: i64,
    pub entity_kind: String,
    pub operation: Operation,
    pub payload: Value,
    pub enqueued_at: String,
}

fn require_id(payload: &Value) -> Result<String, String> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| "mutation payload missing record id".to_string())
}

/// Append a mutation to the queue, applying the optimistic local write in
/// the same transaction. Returns the queue-local id.
///
/// A create without an id is stamped with a temporary `local-{uuid}` id and
/// marked unconfirmed until the server assigns the permanent one.
pub fn enqueue(
    db: &DbState,
    registry: &KindRegistry,
    kind: &str,
    operation: Operation,
    payload: Value,
) -> Result<i64, String> {
    let spec = registry
        .get(kind)
        .ok_or_else(|| format!("unknown entity kind '{kind}'"))?;

    if !payload.is_object() {
        return Err(format!("mutation payload for '{kind}' must be an object"));
    }

    let mut payload = payload;
    let mut conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tx = conn
        .transaction()
        .map_err(|e| format!("begin enqueue: {e}"))?;

    match operation {
        Operation::Create => {
            let id = match payload.get("id").and_then(Value::as_str) {
                Some(id) if !id.trim().is_empty() => id.trim().to_string(),
                _ => {
                    let temp = format!("local-{}", Uuid::new_v4());
                    payload["id"] = Value::String(temp.clone());
                    temp
                }
            };
            db::put_record_tx(&tx, spec, &id, &payload, false)?;
        }
        Operation::Update => {
            let id = if spec.shape == KindShape::Singleton {
                payload
                    .as_object_mut()
                    .map(|obj| {
                        obj.entry("id".to_string())
                            .or_insert_with(|| Value::String(SINGLETON_KEY.to_string()));
                    })
                    .ok_or("singleton payload must be an object")?;
                SINGLETON_KEY.to_string()
            } else {
                require_id(&payload)?
            };
            db::put_record_tx(&tx, spec, &id, &payload, true)?;
        }
        Operation::Delete => {
            let id = require_id(&payload)?;
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", spec.table_name()),
                params![id],
            )
            .map_err(|e| format!("delete {}[{id}]: {e}", spec.table_name()))?;
        }
    }

    let payload_str =
        serde_json::to_string(&payload).map_err(|e| format!("serialize queue payload: {e}"))?;
    tx.execute(
        "INSERT INTO sync_queue (entity_kind, operation, payload) VALUES (?1, ?2, ?3)",
        params![kind, operation.as_str(), payload_str],
    )
    .map_err(|e| format!("enqueue sync: {e}"))?;
    let local_id = tx.last_insert_rowid();

    tx.commit().map_err(|e| format!("commit enqueue: {e}"))?;

    debug!(
        kind = %kind,
        operation = operation.as_str(),
        local_id,
        "mutation queued"
    );
    Ok(local_id)
}

/// Snapshot of due pending mutations grouped by entity kind, FIFO within
/// each group. Rows already failed or awaiting a retry window are skipped.
pub fn drain_grouped(db: &DbState) -> Result<BTreeMap<String, Vec<QueueItem>>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, entity_kind, operation, payload, enqueued_at
             FROM sync_queue
             WHERE status = 'pending'
               AND retry_count < max_retries
               AND (
                    next_retry_at IS NULL
                    OR julianday(next_retry_at) <= julianday('now')
               )
             ORDER BY enqueued_at ASC, id ASC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(|e| e.to_string())?;

    let mut groups: BTreeMap<String, Vec<QueueItem>> = BTreeMap::new();
    for row in rows {
        let (local_id, entity_kind, op_str, payload_str, enqueued_at) = match row {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping unreadable sync_queue row: {e}");
                continue;
            }
        };
        let operation = match Operation::parse(&op_str) {
            Ok(op) => op,
            Err(e) => {
                warn!(local_id, "skipping sync_queue row: {e}");
                continue;
            }
        };
        let payload = match serde_json::from_str(&payload_str) {
            Ok(v) => v,
            Err(e) => {
                warn!(local_id, "skipping sync_queue row with bad payload: {e}");
                continue;
            }
        };
        groups.entry(entity_kind.clone()).or_default().push(QueueItem {
            local_id,
            entity_kind,
            operation,
            payload,
            enqueued_at,
        });
    }
    Ok(groups)
}

/// Delete the given queue rows after a remote round-trip settles them.
pub fn remove_by_local_ids(db: &DbState, ids: &[i64]) -> Result<usize, String> {
    if ids.is_empty() {
        return Ok(0);
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let query = format!("DELETE FROM sync_queue WHERE id IN ({placeholders})");

    let params: Vec<&dyn rusqlite::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

    conn.execute(&query, params.as_slice())
        .map_err(|e| format!("delete from sync_queue: {e}"))
}

/// Number of mutations still awaiting remote confirmation.
pub fn pending_count(db: &DbState) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("count sync_queue: {e}"))
}

/// Record a per-item rejection for a retained queue row: bump the retry
/// counter, store the reason, and schedule the next attempt with bounded
/// exponential backoff. Rows out of retries are marked `failed` and no
/// longer drained.
pub fn record_rejection(db: &DbState, local_id: i64, reason: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (retry_count, max_retries, retry_delay_ms): (i64, i64, i64) = conn
        .query_row(
            "SELECT retry_count, max_retries, retry_delay_ms FROM sync_queue WHERE id = ?1",
            params![local_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| format!("load sync_queue[{local_id}]: {e}"))?;

    let next_count = retry_count + 1;
    if next_count >= max_retries {
        warn!(
            local_id,
            retries = next_count,
            reason = %reason,
            "mutation rejected and out of retries, marking failed"
        );
        conn.execute(
            "UPDATE sync_queue SET status = 'failed', retry_count = ?2, last_error = ?3
             WHERE id = ?1",
            params![local_id, next_count, reason],
        )
        .map_err(|e| format!("mark sync_queue[{local_id}] failed: {e}"))?;
        return Ok(());
    }

    let next_retry_at = schedule_next_retry(retry_delay_ms, local_id);
    let next_delay = (retry_delay_ms * 2).min(MAX_RETRY_DELAY_MS);
    conn.execute(
        "UPDATE sync_queue
         SET retry_count = ?2, last_error = ?3, next_retry_at = ?4, retry_delay_ms = ?5
         WHERE id = ?1",
        params![local_id, next_count, reason, next_retry_at, next_delay],
    )
    .map_err(|e| format!("schedule sync_queue[{local_id}] retry: {e}"))?;
    Ok(())
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
