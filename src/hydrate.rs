//! Hydration loader.
//!
//! Seeds the local store from the remote store on first use: one guard per
//! entity kind so a kind never hydrates twice concurrently, while distinct
//! kinds may proceed in parallel. Collections hydrate only while the local
//! table is empty; singletons only while the fixed-key row is absent;
//! `Always` kinds re-pull on every call and rely on upsert writes.
//!
//! A failed pull is not an error from the caller's perspective — the local
//! store is left as-is and callers treat the absence of data as "not yet
//! loaded".

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{self, DbState, SINGLETON_KEY};
use crate::registry::{HydrationPolicy, KindRegistry, KindShape, KindSpec};
use crate::remote::RemoteStore;

/// What a hydration call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// Pulled and wrote this many records.
    Hydrated(usize),
    /// Local data already present; nothing pulled.
    AlreadyLoaded,
    /// Another hydration attempt for this kind is in flight.
    InFlight,
    /// The remote store was unreachable; local store left as-is.
    Offline,
}

/// Per-kind hydration driver, generic over the transport.
pub struct Hydrator<T: RemoteStore> {
    db: Arc<DbState>,
    remote: Arc<T>,
    registry: Arc<KindRegistry>,
    guards: HashMap<&'static str, AtomicBool>,
}

impl<T: RemoteStore> Hydrator<T> {
    pub fn new(db: Arc<DbState>, remote: Arc<T>, registry: Arc<KindRegistry>) -> Self {
        let guards = registry
            .iter()
            .map(|spec| (spec.name, AtomicBool::new(false)))
            .collect();
        Self {
            db,
            remote,
            registry,
            guards,
        }
    }

    /// Hydrate one entity kind according to its policy.
    ///
    /// Local-store failures are errors; remote failures are logged and
    /// reported as [`HydrationOutcome::Offline`].
    pub async fn hydrate(&self, kind: &str) -> Result<HydrationOutcome, String> {
        let spec = *self
            .registry
            .get(kind)
            .ok_or_else(|| format!("unknown entity kind '{kind}'"))?;
        let guard = self
            .guards
            .get(spec.name)
            .ok_or_else(|| format!("no hydration guard for '{kind}'"))?;

        if guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(kind = %kind, "hydration already in flight, skipping");
            return Ok(HydrationOutcome::InFlight);
        }

        let result = self.hydrate_inner(&spec).await;
        guard.store(false, Ordering::SeqCst);
        result
    }

    async fn hydrate_inner(&self, spec: &KindSpec) -> Result<HydrationOutcome, String> {
        if spec.hydration == HydrationPolicy::IfEmpty {
            let loaded = match spec.shape {
                KindShape::Collection => db::count_records(&self.db, spec)? > 0,
                KindShape::Singleton => {
                    db::get_record(&self.db, spec, SINGLETON_KEY)?.is_some()
                }
            };
            if loaded {
                debug!(kind = %spec.name, "local data present, skipping hydration");
                return Ok(HydrationOutcome::AlreadyLoaded);
            }
        }

        let data = match self.remote.pull(spec.name).await {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    kind = %spec.name,
                    error = %e,
                    "hydration pull failed, leaving local store as-is"
                );
                return Ok(HydrationOutcome::Offline);
            }
        };

        let records: Vec<(String, Value)> = match spec.shape {
            KindShape::Singleton => vec![(SINGLETON_KEY.to_string(), data)],
            KindShape::Collection => {
                let rows = data.as_array().ok_or_else(|| {
                    format!("hydration payload for '{}' is not an array", spec.name)
                })?;
                rows.iter()
                    .filter_map(|record| {
                        match record.get("id").and_then(Value::as_str).map(str::trim) {
                            Some(id) if !id.is_empty() => {
                                Some((id.to_string(), record.clone()))
                            }
                            _ => {
                                warn!(
                                    kind = %spec.name,
                                    "skipping hydrated record without id"
                                );
                                None
                            }
                        }
                    })
                    .collect()
            }
        };

        let written = db::bulk_put_records(&self.db, spec, &records)?;
        info!(kind = %spec.name, records = written, "hydrated entity kind");
        Ok(HydrationOutcome::Hydrated(written))
    }

    /// Hydrate every registered kind, logging failures and continuing; used
    /// at client startup when connectivity allows.
    pub async fn hydrate_all(&self) {
        for spec in self.registry.iter() {
            if let Err(e) = self.hydrate(spec.name).await {
                warn!(kind = %spec.name, error = %e, "hydration failed");
            }
        }
    }
}
