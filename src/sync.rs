//! Background synchronizer.
//!
//! Drains the mutation queue, groups pending items by entity kind, and
//! pushes each group to that kind's remote batch-apply endpoint. One
//! synchronizer instance per client process; a guard flag keeps cycles from
//! overlapping, so triggers arriving mid-cycle are no-ops picked up by the
//! next tick or enqueue signal.
//!
//! Within one entity kind, mutations are delivered in enqueue order. Across
//! kinds there is no ordering guarantee: each kind's batch is an
//! independent network call, and a failing kind never blocks the others.

use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::queue::{self, QueueItem};
use crate::registry::KindRegistry;
use crate::remote::{BatchItemResult, BatchItemStatus, BatchOp, BatchResponse, Operation, RemoteStore};
use crate::status::{StatusPublisher, SyncStatus};

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Cadence of the background loop. Enqueues and reconnects wake the
    /// loop earlier.
    pub interval: Duration,
    /// When false (the default), a successful batch call settles every sent
    /// item — rejected items are logged and dropped alongside fulfilled
    /// siblings. When true, rejected items stay queued and retry with
    /// bounded backoff until their retry budget runs out.
    pub retain_rejected: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retain_rejected: false,
        }
    }
}

/// Process-wide synchronizer owning its timer, in-flight guard, and status
/// publisher. Constructed with an injected transport so tests can script
/// connectivity and batch outcomes.
pub struct Synchronizer<T: RemoteStore> {
    db: Arc<DbState>,
    remote: Arc<T>,
    registry: Arc<KindRegistry>,
    options: SyncOptions,
    status: StatusPublisher,
    notify: Notify,
    in_flight: AtomicBool,
    running: AtomicBool,
    last_sync: Mutex<Option<String>>,
}

impl<T: RemoteStore + 'static> Synchronizer<T> {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<T>,
        registry: Arc<KindRegistry>,
        options: SyncOptions,
    ) -> Self {
        Self {
            db,
            remote,
            registry,
            options,
            status: StatusPublisher::new(),
            notify: Notify::new(),
            in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// RFC 3339 timestamp of the last completed cycle, if any.
    pub fn last_sync(&self) -> Option<String> {
        self.last_sync.lock().ok().and_then(|guard| guard.clone())
    }

    /// Mutations still awaiting remote confirmation.
    pub fn pending_count(&self) -> Result<i64, String> {
        queue::pending_count(&self.db)
    }

    /// Apply a mutation locally (optimistic write plus queue append) and
    /// signal the background loop. Completes synchronously; no network I/O.
    pub fn enqueue(&self, kind: &str, operation: Operation, payload: Value) -> Result<i64, String> {
        let local_id = queue::enqueue(&self.db, &self.registry, kind, operation, payload)?;
        self.notify.notify_one();
        Ok(local_id)
    }

    /// Run one sync cycle. Returns the number of queue items settled.
    /// A trigger while a cycle is already in flight is a no-op.
    pub async fn run_cycle(&self) -> Result<usize, String> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync cycle already in flight, trigger ignored");
            return Ok(0);
        }

        let result = self.cycle_inner().await;
        if result.is_err() {
            // A failed cycle must still leave a terminal status behind,
            // never `syncing` with nothing in flight.
            self.publish_boundary_status().await;
        }
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Publish the end-of-cycle status: `Idle` while connected, `Offline`
    /// when connectivity dropped during the cycle.
    async fn publish_boundary_status(&self) {
        if self.remote.is_online().await {
            self.status.set(SyncStatus::Idle);
        } else {
            self.status.set(SyncStatus::Offline);
        }
    }

    async fn cycle_inner(&self) -> Result<usize, String> {
        if !self.remote.is_online().await {
            self.status.set(SyncStatus::Offline);
            return Ok(0);
        }

        self.status.set(SyncStatus::Syncing);

        let groups = queue::drain_grouped(&self.db)?;
        let mut settled = 0;

        for (kind, items) in &groups {
            let ops: Vec<BatchOp> = items
                .iter()
                .map(|item| BatchOp {
                    operation: item.operation,
                    data: item.payload.clone(),
                })
                .collect();

            match self.remote.push_batch(kind, ops).await {
                Ok(response) => {
                    settled += self.settle_batch(kind, items, &response)?;
                }
                Err(e) => {
                    // Transport failure: the whole group stays queued for
                    // the next trigger; other kinds still get their shot.
                    warn!(kind = %kind, error = %e, "batch push failed, group stays queued");
                }
            }
        }

        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }

        // Going offline mid-cycle is detected here, at the cycle boundary.
        self.publish_boundary_status().await;

        Ok(settled)
    }

    /// Settle one kind's batch against the per-item outcomes. The server
    /// accepted the request, so by default every sent localId is removed —
    /// including rejected items, which are surfaced via logging only. With
    /// `retain_rejected` they stay queued for a backoff retry instead.
    fn settle_batch(
        &self,
        kind: &str,
        items: &[QueueItem],
        response: &BatchResponse,
    ) -> Result<usize, String> {
        if response.results.len() != items.len() {
            warn!(
                kind = %kind,
                sent = items.len(),
                received = response.results.len(),
                "batch response length mismatch"
            );
        }

        let mut remove: Vec<i64> = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            match response.results.get(idx) {
                Some(result) if result.status == BatchItemStatus::Rejected => {
                    let reason = result.reason.as_deref().unwrap_or("no reason given");
                    warn!(
                        kind = %kind,
                        local_id = item.local_id,
                        operation = item.operation.as_str(),
                        reason = %reason,
                        "remote rejected mutation"
                    );
                    if self.options.retain_rejected {
                        queue::record_rejection(&self.db, item.local_id, reason)?;
                    } else {
                        remove.push(item.local_id);
                    }
                }
                Some(result) => {
                    if item.operation == Operation::Create {
                        self.confirm_created(kind, item, result)?;
                    }
                    remove.push(item.local_id);
                }
                None => {
                    // Contract violation; treat like a missing outcome.
                    if self.options.retain_rejected {
                        queue::record_rejection(
                            &self.db,
                            item.local_id,
                            "no result returned for item",
                        )?;
                    } else {
                        remove.push(item.local_id);
                    }
                }
            }
        }

        queue::remove_by_local_ids(&self.db, &remove)?;
        Ok(remove.len())
    }

    /// Swap a temporary client id for the server-assigned permanent one on
    /// a fulfilled create, and mark the record confirmed.
    fn confirm_created(
        &self,
        kind: &str,
        item: &QueueItem,
        result: &BatchItemResult,
    ) -> Result<(), String> {
        let Some(spec) = self.registry.get(kind) else {
            return Ok(());
        };
        let Some(data) = result.data.as_ref() else {
            return Ok(());
        };
        let Some(remote_id) = data
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return Ok(());
        };

        let temp_id = item
            .payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty());

        if let Some(temp_id) = temp_id {
            if temp_id != remote_id {
                db::delete_record(&self.db, spec, temp_id)?;
            }
        }
        db::bulk_put_records(&self.db, spec, &[(remote_id.to_string(), data.clone())])?;
        debug!(
            kind = %kind,
            remote_id = %remote_id,
            "create confirmed with server-assigned id"
        );
        Ok(())
    }

    /// Start the background loop. Wakes on the interval tick or on an
    /// enqueue signal; an offline-to-online transition is picked up by the
    /// next wake, which then drains whatever is still queued.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let me = Arc::clone(self);

        tokio::spawn(async move {
            info!(
                interval_secs = me.options.interval.as_secs(),
                "sync loop started"
            );
            let mut previous_online: Option<bool> = None;

            loop {
                if !me.running.load(Ordering::SeqCst) {
                    info!("sync loop stopped");
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(me.options.interval) => {}
                    _ = me.notify.notified() => {}
                }

                if !me.running.load(Ordering::SeqCst) {
                    info!("sync loop stopped");
                    break;
                }

                let online = me.remote.is_online().await;
                if !online {
                    if previous_online != Some(false) {
                        info!("network offline; keeping queue pending");
                    }
                    previous_online = Some(false);
                    me.status.set(SyncStatus::Offline);
                    continue;
                }
                if previous_online == Some(false) {
                    info!("network restored; resuming queued sync");
                }
                previous_online = Some(true);

                match me.run_cycle().await {
                    Ok(settled) if settled > 0 => {
                        info!(settled, "sync cycle complete");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sync cycle failed"),
                }
            }
        })
    }

    /// Ask the background loop to exit after its current wake.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fulfilled, rejected, test_db_with_registry_arc, MockRemote};

    fn setup(options: SyncOptions) -> (Arc<Synchronizer<MockRemote>>, Arc<MockRemote>) {
        let registry = Arc::new(KindRegistry::default_pos());
        let db = test_db_with_registry_arc(&registry);
        let remote = Arc::new(MockRemote::new());
        let sync = Arc::new(Synchronizer::new(db, remote.clone(), registry, options));
        (sync, remote)
    }

    #[tokio::test]
    async fn test_batches_preserve_enqueue_order_within_kind() {
        let (sync, remote) = setup(SyncOptions::default());

        for name in ["a", "b", "c"] {
            sync.enqueue(
                "product",
                Operation::Create,
                serde_json::json!({"name": name}),
            )
            .unwrap();
        }
        sync.run_cycle().await.unwrap();

        let pushes = remote.pushes();
        assert_eq!(pushes.len(), 1);
        let (kind, ops) = &pushes[0];
        assert_eq!(kind, "product");
        let names: Vec<&str> = ops
            .iter()
            .map(|op| op.data["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_rejected_item_does_not_block_siblings_or_other_kinds() {
        let (sync, remote) = setup(SyncOptions::default());

        sync.enqueue("product", Operation::Create, serde_json::json!({"name": "ok"}))
            .unwrap();
        sync.enqueue(
            "product",
            Operation::Update,
            serde_json::json!({"id": "p9", "name": "bad"}),
        )
        .unwrap();
        sync.enqueue(
            "client",
            Operation::Update,
            serde_json::json!({"id": "c1"}),
        )
        .unwrap();

        remote.script_push_response(
            "product",
            Ok(BatchResponse {
                success: true,
                results: vec![
                    fulfilled(Operation::Create, serde_json::json!({"id": "p-1"})),
                    rejected(Operation::Update, "record not found"),
                ],
            }),
        );

        let settled = sync.run_cycle().await.unwrap();
        assert_eq!(settled, 3);

        // Both kinds were pushed despite the rejection
        let kinds: Vec<String> = remote.pushes().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(kinds, vec!["client".to_string(), "product".to_string()]);
    }

    #[tokio::test]
    async fn test_successful_batch_removes_all_sent_ids_including_rejected() {
        // Current remove-on-success behavior: three creates, server answers
        // fulfilled/fulfilled/rejected, queue is empty afterwards. The
        // rejected create is gone from the client's perspective — see the
        // companion test for the retain_rejected configuration that keeps
        // it queued instead.
        let (sync, remote) = setup(SyncOptions::default());

        for name in ["a", "b", "c"] {
            sync.enqueue(
                "product",
                Operation::Create,
                serde_json::json!({"name": name}),
            )
            .unwrap();
        }
        remote.script_push_response(
            "product",
            Ok(BatchResponse {
                success: true,
                results: vec![
                    fulfilled(Operation::Create, serde_json::json!({"id": "p-1"})),
                    fulfilled(Operation::Create, serde_json::json!({"id": "p-2"})),
                    rejected(Operation::Create, "duplicate sku"),
                ],
            }),
        );

        sync.run_cycle().await.unwrap();
        assert_eq!(sync.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retain_rejected_keeps_item_queued_for_backoff_retry() {
        let (sync, remote) = setup(SyncOptions {
            interval: Duration::from_secs(30),
            retain_rejected: true,
        });

        let local_id = sync
            .enqueue(
                "product",
                Operation::Create,
                serde_json::json!({"name": "x"}),
            )
            .unwrap();
        remote.script_push_response(
            "product",
            Ok(BatchResponse {
                success: true,
                results: vec![rejected(Operation::Create, "duplicate sku")],
            }),
        );

        let settled = sync.run_cycle().await.unwrap();
        assert_eq!(settled, 0);
        assert_eq!(sync.pending_count().unwrap(), 1);

        let conn = sync.db.conn.lock().unwrap();
        let (retry_count, last_error): (i64, String) = conn
            .query_row(
                "SELECT retry_count, last_error FROM sync_queue WHERE id = ?1",
                rusqlite::params![local_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(retry_count, 1);
        assert_eq!(last_error, "duplicate sku");
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_group_queued() {
        let (sync, remote) = setup(SyncOptions::default());

        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();
        remote.script_push_response("product", Err("Connection to remote timed out".to_string()));

        let settled = sync.run_cycle().await.unwrap();
        assert_eq!(settled, 0);
        assert_eq!(sync.pending_count().unwrap(), 1);
        // Still online, so the cycle ends idle and the next trigger retries
        assert_eq!(sync.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_offline_cycle_is_a_no_op() {
        let (sync, remote) = setup(SyncOptions::default());
        remote.set_online(false);

        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();

        let settled = sync.run_cycle().await.unwrap();
        assert_eq!(settled, 0);
        assert_eq!(sync.status(), SyncStatus::Offline);
        assert_eq!(sync.pending_count().unwrap(), 1);
        assert!(remote.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_going_offline_mid_cycle_keeps_unsent_groups() {
        // Two kinds: "client" settles first (BTreeMap order), then the
        // connection drops before "product" is pushed.
        let (sync, remote) = setup(SyncOptions::default());

        sync.enqueue(
            "client",
            Operation::Update,
            serde_json::json!({"id": "c1"}),
        )
        .unwrap();
        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();
        remote.go_offline_after_push("client");

        let settled = sync.run_cycle().await.unwrap();
        assert_eq!(settled, 1);
        assert_eq!(sync.status(), SyncStatus::Offline);

        // The already-settled group stays removed; the unsent one is intact
        let groups = queue::drain_grouped(&sync.db).unwrap();
        assert!(!groups.contains_key("client"));
        assert_eq!(groups["product"].len(), 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_still_leaves_terminal_status() {
        // A local-store error mid-cycle must not leave observers stuck on
        // `syncing` with no cycle in flight.
        let (sync, _remote) = setup(SyncOptions::default());
        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();

        {
            let conn = sync.db.conn.lock().unwrap();
            conn.execute_batch("DROP TABLE sync_queue").unwrap();
        }

        assert!(sync.run_cycle().await.is_err());
        assert_eq!(sync.status(), SyncStatus::Idle);
        assert!(!sync.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue_held_while_offline() {
        let (sync, remote) = setup(SyncOptions::default());
        remote.set_online(false);

        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();
        sync.run_cycle().await.unwrap();
        assert_eq!(sync.status(), SyncStatus::Offline);
        assert_eq!(sync.pending_count().unwrap(), 1);

        // Connectivity restored: the next trigger drains the held queue
        remote.set_online(true);
        assert_eq!(sync.run_cycle().await.unwrap(), 1);
        assert_eq!(sync.status(), SyncStatus::Idle);
        assert_eq!(sync.pending_count().unwrap(), 0);
        assert_eq!(remote.pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_after_final_successful_batch_ends_offline() {
        // Only one kind queued; its push succeeds and the connection drops
        // right after, so the boundary probe must end the cycle at offline.
        let (sync, remote) = setup(SyncOptions::default());
        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();
        remote.go_offline_after_push("product");

        assert_eq!(sync.run_cycle().await.unwrap(), 1);
        assert_eq!(sync.status(), SyncStatus::Offline);
    }

    #[tokio::test]
    async fn test_in_flight_guard_makes_triggers_no_ops() {
        let (sync, remote) = setup(SyncOptions::default());
        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();

        sync.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(sync.run_cycle().await.unwrap(), 0);
        assert!(remote.pushes().is_empty());

        sync.in_flight.store(false, Ordering::SeqCst);
        assert_eq!(sync.run_cycle().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fulfilled_create_swaps_temp_id_for_server_id() {
        let (sync, remote) = setup(SyncOptions::default());

        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "Espresso"}),
        )
        .unwrap();
        remote.script_push_response(
            "product",
            Ok(BatchResponse {
                success: true,
                results: vec![fulfilled(
                    Operation::Create,
                    serde_json::json!({"id": "p-77", "name": "Espresso"}),
                )],
            }),
        );

        sync.run_cycle().await.unwrap();

        let spec = sync.registry.get("product").unwrap();
        assert_eq!(db::count_records(&sync.db, spec).unwrap(), 1);
        let record = db::get_record(&sync.db, spec, "p-77").unwrap().unwrap();
        assert_eq!(record["name"], "Espresso");

        let conn = sync.db.conn.lock().unwrap();
        let confirmed: i64 = conn
            .query_row(
                "SELECT confirmed FROM records_product WHERE id = 'p-77'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn test_background_loop_drains_on_enqueue_signal() {
        let (sync, remote) = setup(SyncOptions {
            // Long interval so only the enqueue signal can wake the loop
            interval: Duration::from_secs(3600),
            retain_rejected: false,
        });
        let handle = sync.start();

        sync.enqueue(
            "product",
            Operation::Create,
            serde_json::json!({"name": "x"}),
        )
        .unwrap();

        // Wait for the loop to pick the signal up
        let mut drained = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if sync.pending_count().unwrap() == 0 {
                drained = true;
                break;
            }
        }
        assert!(drained, "background loop never drained the queue");
        assert_eq!(remote.pushes().len(), 1);

        sync.stop();
        handle.await.unwrap();
    }
}
