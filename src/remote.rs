//! Remote store boundary.
//!
//! Wire types for the per-kind batch-apply contract and the transport trait
//! the synchronizer, hydration loader, and dispatch client are generic over.
//! The production implementation is [`crate::api::HttpRemote`]; tests inject
//! a scripted double.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

/// Mutation operation carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation '{other}'")),
        }
    }
}

/// One operation inside a batch POST to `/{kind}/sync`. The queue-local id
/// is never part of the wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOp {
    pub operation: Operation,
    pub data: Value,
}

/// Per-item outcome tag inside a batch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Fulfilled,
    Rejected,
}

/// Per-item result inside a batch response. `data` is set for fulfilled
/// items (server-side record, including the permanent id for creates);
/// `reason` is a human-readable explanation for rejected ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub status: BatchItemStatus,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Response of one batch-apply call. Per the endpoint contract the results
/// array matches the request length and order; one item's rejection does
/// not block its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub success: bool,
    pub results: Vec<BatchItemResult>,
}

/// One requested line of a dispatch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchItem {
    #[serde(rename = "productId")]
    pub product_id: String,
    pub quantity: i64,
}

/// Transport to the remote store. Methods return `Send` futures so the
/// background sync loop can be spawned onto the runtime.
pub trait RemoteStore: Send + Sync {
    /// Lightweight connectivity probe.
    fn is_online(&self) -> impl Future<Output = bool> + Send;

    /// Pull the full remote collection (or singleton record) for a kind.
    fn pull(&self, kind: &str) -> impl Future<Output = Result<Value, String>> + Send;

    /// Push an ordered batch of operations for one kind.
    fn push_batch(
        &self,
        kind: &str,
        ops: Vec<BatchOp>,
    ) -> impl Future<Output = Result<BatchResponse, String>> + Send;

    /// Run the dispatch operation on a sale, returning the updated sale
    /// record. Never queued; requires a live connection.
    fn dispatch(
        &self,
        sale_id: &str,
        items: Vec<DispatchItem>,
    ) -> impl Future<Output = Result<Value, String>> + Send;
}
