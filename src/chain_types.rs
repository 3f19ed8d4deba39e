//! Chain-facing types shared by the Reorg Guard, Feed Registry, Tx
//! Manager, Job Engine, and Event Listener: job records, decoded chain
//! events, and the calls the node produces.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    DataFeed,
    Vrf,
    Compute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    InFlight,
    Completed,
    DeadLettered,
}

/// Opaque key/value bag; semantics depend on `kind`.
pub type JobParams = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub kind: JobKind,
    pub params: JobParams,
    pub requester: String,
    pub created_at: u64,
    pub attempts: u32,
    pub status: JobStatus,
}

/// Synthesizes a job id when the chain event carries no request id of
/// its own (e.g. a heartbeat-triggered refresh).
pub fn synthesize_job_id() -> String {
    Uuid::new_v4().to_string()
}

impl JobRequest {
    pub fn new_data_feed(
        id: String,
        feed_id: &str,
        min: U256,
        max: U256,
        requester: Address,
        created_at: u64,
    ) -> Self {
        let mut params = JobParams::new();
        params.insert("feedId".into(), serde_json::json!(feed_id));
        params.insert("min".into(), serde_json::json!(min.to_string()));
        params.insert("max".into(), serde_json::json!(max.to_string()));
        Self {
            id,
            kind: JobKind::DataFeed,
            params,
            requester: format!("{:#x}", requester),
            created_at,
            attempts: 0,
            status: JobStatus::Pending,
        }
    }

    pub fn new_vrf(id: String, seed: H256, requester: Address, created_at: u64) -> Self {
        let mut params = JobParams::new();
        params.insert("seed".into(), serde_json::json!(format!("{:#x}", seed)));
        Self {
            id,
            kind: JobKind::Vrf,
            params,
            requester: format!("{:#x}", requester),
            created_at,
            attempts: 0,
            status: JobStatus::Pending,
        }
    }

    /// Synthesized by the Feed Registry's heartbeat trigger when a feed
    /// has gone silent past its configured heartbeat window. Carries no
    /// on-chain requester bounds, so the range proof uses the widest
    /// possible `[0, u128::MAX]` interval rather than gating the refresh
    /// on request-specific bounds that do not exist for a self-triggered
    /// job.
    pub fn new_heartbeat(feed_id: &str, created_at: u64) -> Self {
        let mut params = JobParams::new();
        params.insert("feedId".into(), serde_json::json!(feed_id));
        params.insert("min".into(), serde_json::json!("0"));
        params.insert("max".into(), serde_json::json!(u128::MAX.to_string()));
        Self {
            id: synthesize_job_id(),
            kind: JobKind::DataFeed,
            params,
            requester: "heartbeat".to_string(),
            created_at,
            attempts: 0,
            status: JobStatus::Pending,
        }
    }
}

/// `RequestData(requestId, apiUrl, min, max, requester[, oevEnabled,
/// beneficiary, isOptimistic])`. The extended fields default when the
/// contract emits the shorter legacy form.
#[derive(Debug, Clone)]
pub struct RequestDataEvent {
    pub request_id: U256,
    pub api_url: String,
    pub min: U256,
    pub max: U256,
    pub requester: Address,
    pub oev_enabled: bool,
    pub beneficiary: Address,
    pub is_optimistic: bool,
}

#[derive(Debug, Clone)]
pub struct RequestRandomnessEvent {
    pub request_id: U256,
    pub seed: H256,
    pub requester: Address,
}

/// Tagged decode result accommodating both legacy and extended event
/// shapes without failing decode on unknown trailing fields.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    RequestData(RequestDataEvent),
    RequestRandomness(RequestRandomnessEvent),
}
