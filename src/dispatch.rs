//! Sale dispatch state machine.
//!
//! Confirms physical fulfillment of some or all quantity of a sale's line
//! items and decrements the paired stock counters. The state transition is
//! computed as a pure function over the sale and the current stock levels,
//! then persisted inside a single transaction: any validation failure rolls
//! the whole request back, leaving both the sale and every stock counter
//! untouched.
//!
//! Dispatch bypasses the mutation queue — it needs a consistent stock check
//! that cannot be resolved optimistically offline, so the client path posts
//! straight to the remote store.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::registry::KindRegistry;
use crate::remote::{DispatchItem, RemoteStore};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Sale-level dispatch progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    PartiallyDispatched,
    Dispatched,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::PartiallyDispatched => "partially_dispatched",
            DispatchStatus::Dispatched => "dispatched",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(DispatchStatus::Pending),
            "partially_dispatched" => Ok(DispatchStatus::PartiallyDispatched),
            "dispatched" => Ok(DispatchStatus::Dispatched),
            other => Err(format!("unknown dispatch status '{other}'")),
        }
    }
}

/// One line item of a sale. `stock_id` links a stock-tracked product to its
/// inventory counter; service items carry none and are exempt from stock
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleItem {
    #[serde(rename = "productId")]
    pub product_id: String,
    #[serde(rename = "stockId", default, skip_serializing_if = "Option::is_none")]
    pub stock_id: Option<String>,
    #[serde(rename = "orderedQuantity")]
    pub ordered_quantity: i64,
    #[serde(rename = "dispatchedQuantity", default)]
    pub dispatched_quantity: i64,
    #[serde(rename = "isService", default)]
    pub is_service: bool,
}

impl SaleItem {
    pub fn remaining(&self) -> i64 {
        self.ordered_quantity - self.dispatched_quantity
    }
}

/// A sale record with its dispatch state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sale {
    pub id: String,
    pub items: Vec<SaleItem>,
    #[serde(rename = "dispatchStatus")]
    pub dispatch_status: DispatchStatus,
}

/// Why a dispatch request was rejected. The whole request fails as a unit;
/// the display strings double as the reason surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("sale {0} is already fully dispatched")]
    AlreadyDispatched(String),
    #[error("negative quantity {quantity} requested for product {product_id}")]
    NegativeQuantity { product_id: String, quantity: i64 },
    #[error("product {0} is not part of this sale")]
    UnknownItem(String),
    #[error("cannot dispatch {requested} of product {product_id}: only {remaining} remaining")]
    ExceedsRemaining {
        product_id: String,
        requested: i64,
        remaining: i64,
    },
    #[error("product {0} is stock-tracked but has no stock reference")]
    MissingStockReference(String),
    #[error(
        "insufficient stock for product {product_id}: {available} available, {requested} requested"
    )]
    InsufficientStock {
        product_id: String,
        available: i64,
        requested: i64,
    },
}

/// Result of a validated dispatch: the updated sale and the stock
/// decrements to apply alongside it.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub sale: Sale,
    pub stock_decrements: Vec<(String, i64)>,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Recompute the sale-level status from its items:
/// `Dispatched` iff every item is fully dispatched, `PartiallyDispatched`
/// if any item has progress, otherwise `Pending`.
pub fn compute_status(items: &[SaleItem]) -> DispatchStatus {
    let fully = items
        .iter()
        .all(|item| item.dispatched_quantity == item.ordered_quantity);
    if fully {
        return DispatchStatus::Dispatched;
    }
    if items.iter().any(|item| item.dispatched_quantity > 0) {
        DispatchStatus::PartiallyDispatched
    } else {
        DispatchStatus::Pending
    }
}

/// Validate a dispatch request against a sale and the current stock levels,
/// and compute the resulting state. Pure: no effect unless every requested
/// line passes, which is what makes the persisted operation all-or-nothing.
pub fn apply_dispatch(
    sale: &Sale,
    stock: &HashMap<String, i64>,
    requested: &[DispatchItem],
) -> Result<DispatchOutcome, DispatchError> {
    if sale.dispatch_status == DispatchStatus::Dispatched {
        return Err(DispatchError::AlreadyDispatched(sale.id.clone()));
    }

    // Planned quantity per line item and accumulated decrement per stock id,
    // so duplicate request lines for the same product are validated against
    // the combined total.
    let mut planned: HashMap<usize, i64> = HashMap::new();
    let mut decrements: HashMap<String, i64> = HashMap::new();

    for req in requested {
        if req.quantity < 0 {
            return Err(DispatchError::NegativeQuantity {
                product_id: req.product_id.clone(),
                quantity: req.quantity,
            });
        }

        let idx = sale
            .items
            .iter()
            .position(|item| item.product_id == req.product_id)
            .ok_or_else(|| DispatchError::UnknownItem(req.product_id.clone()))?;
        let item = &sale.items[idx];

        let line_total = planned.get(&idx).copied().unwrap_or(0) + req.quantity;
        if line_total > item.remaining() {
            return Err(DispatchError::ExceedsRemaining {
                product_id: req.product_id.clone(),
                requested: line_total,
                remaining: item.remaining(),
            });
        }
        planned.insert(idx, line_total);

        if !item.is_service {
            let stock_id = item.stock_id.as_ref().ok_or_else(|| {
                DispatchError::MissingStockReference(req.product_id.clone())
            })?;
            let total = decrements.get(stock_id).copied().unwrap_or(0) + req.quantity;
            let available = stock.get(stock_id).copied().unwrap_or(0);
            if total > available {
                return Err(DispatchError::InsufficientStock {
                    product_id: req.product_id.clone(),
                    available,
                    requested: total,
                });
            }
            decrements.insert(stock_id.clone(), total);
        }
    }

    let mut sale = sale.clone();
    for (idx, quantity) in &planned {
        sale.items[*idx].dispatched_quantity += quantity;
    }
    sale.dispatch_status = compute_status(&sale.items);

    let mut stock_decrements: Vec<(String, i64)> = decrements
        .into_iter()
        .filter(|(_, qty)| *qty > 0)
        .collect();
    stock_decrements.sort();

    Ok(DispatchOutcome {
        sale,
        stock_decrements,
    })
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

fn load_sale(conn: &Connection, sale_id: &str) -> Result<Option<Sale>, String> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT items, dispatch_status FROM sales WHERE id = ?1",
            params![sale_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("load sale {sale_id}: {e}"))?;

    let Some((items_str, status_str)) = row else {
        return Ok(None);
    };

    let items: Vec<SaleItem> = serde_json::from_str(&items_str)
        .map_err(|e| format!("parse sale {sale_id} items: {e}"))?;
    let dispatch_status = DispatchStatus::parse(&status_str)?;
    Ok(Some(Sale {
        id: sale_id.to_string(),
        items,
        dispatch_status,
    }))
}

/// Insert a new sale row with zero dispatch progress.
pub fn insert_sale(db: &DbState, sale: &Sale) -> Result<(), String> {
    let items =
        serde_json::to_string(&sale.items).map_err(|e| format!("serialize sale items: {e}"))?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO sales (id, items, dispatch_status) VALUES (?1, ?2, ?3)",
        params![sale.id, items, sale.dispatch_status.as_str()],
    )
    .map_err(|e| format!("insert sale {}: {e}", sale.id))?;
    Ok(())
}

/// Upsert a stock counter.
pub fn set_stock_level(db: &DbState, stock_id: &str, quantity: i64) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO stock_levels (stock_id, quantity, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(stock_id) DO UPDATE SET
            quantity = excluded.quantity,
            updated_at = excluded.updated_at",
        params![stock_id, quantity],
    )
    .map_err(|e| format!("set stock level {stock_id}: {e}"))?;
    Ok(())
}

/// Read a stock counter; missing rows count as zero.
pub fn get_stock_level(db: &DbState, stock_id: &str) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let quantity: Option<i64> = conn
        .query_row(
            "SELECT quantity FROM stock_levels WHERE stock_id = ?1",
            params![stock_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("get stock level {stock_id}: {e}"))?;
    Ok(quantity.unwrap_or(0))
}

/// Fetch a sale by id.
pub fn get_sale(db: &DbState, sale_id: &str) -> Result<Option<Sale>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_sale(&conn, sale_id)
}

/// Execute a dispatch request against the store as one all-or-nothing unit:
/// read the sale and stock counters, validate and compute the transition,
/// persist the updated sale and every stock decrement, commit. Any failure
/// rolls back with no partial effect.
pub fn execute(
    db: &DbState,
    sale_id: &str,
    requested: &[DispatchItem],
) -> Result<Sale, String> {
    let mut conn = db.conn.lock().map_err(|e| e.to_string())?;
    let tx = conn
        .transaction()
        .map_err(|e| format!("begin dispatch: {e}"))?;

    let sale = load_sale(&tx, sale_id)?.ok_or_else(|| format!("sale {sale_id} not found"))?;

    let mut stock: HashMap<String, i64> = HashMap::new();
    for item in &sale.items {
        if let Some(stock_id) = &item.stock_id {
            let quantity: Option<i64> = tx
                .query_row(
                    "SELECT quantity FROM stock_levels WHERE stock_id = ?1",
                    params![stock_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| format!("read stock {stock_id}: {e}"))?;
            stock.insert(stock_id.clone(), quantity.unwrap_or(0));
        }
    }

    let outcome = match apply_dispatch(&sale, &stock, requested) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(sale_id = %sale_id, reason = %e, "dispatch rejected");
            return Err(e.to_string());
        }
    };

    for (stock_id, quantity) in &outcome.stock_decrements {
        tx.execute(
            "UPDATE stock_levels
             SET quantity = quantity - ?2, updated_at = datetime('now')
             WHERE stock_id = ?1",
            params![stock_id, quantity],
        )
        .map_err(|e| format!("decrement stock {stock_id}: {e}"))?;
    }

    let items = serde_json::to_string(&outcome.sale.items)
        .map_err(|e| format!("serialize sale items: {e}"))?;
    tx.execute(
        "UPDATE sales SET items = ?2, dispatch_status = ?3, updated_at = datetime('now')
         WHERE id = ?1",
        params![sale_id, items, outcome.sale.dispatch_status.as_str()],
    )
    .map_err(|e| format!("update sale {sale_id}: {e}"))?;

    tx.commit().map_err(|e| format!("commit dispatch: {e}"))?;

    info!(
        sale_id = %sale_id,
        status = outcome.sale.dispatch_status.as_str(),
        lines = requested.len(),
        "dispatch applied"
    );
    Ok(outcome.sale)
}

// ---------------------------------------------------------------------------
// Client path
// ---------------------------------------------------------------------------

/// Dispatch via the remote store and mirror the returned sale record into
/// the local store. Unlike queued mutations this surfaces failures
/// synchronously to the caller with the server's reason string.
pub async fn dispatch_remote<T: RemoteStore>(
    db: &DbState,
    registry: &KindRegistry,
    remote: &T,
    sale_id: &str,
    items: &[DispatchItem],
) -> Result<Value, String> {
    let updated = remote.dispatch(sale_id, items.to_vec()).await?;

    if let Some(spec) = registry.get("sale") {
        if let Some(id) = updated.get("id").and_then(Value::as_str) {
            db::bulk_put_records(db, spec, &[(id.to_string(), updated.clone())])?;
        }
    }

    Ok(updated)
}
