//! Lane and job types for the queue broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::WorkOrderPriority;

/// One of the five broker lanes.
///
/// Three priority lanes for work orders, plus two control lanes carrying
/// clarification traffic between workers and the human reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    High,
    Default,
    Low,
    WorkerRequests,
    ControllerResponses,
}

impl Lane {
    /// All lanes, in stats-reporting order.
    pub const ALL: [Lane; 5] = [
        Lane::High,
        Lane::Default,
        Lane::Low,
        Lane::WorkerRequests,
        Lane::ControllerResponses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
            Self::WorkerRequests => "worker_requests",
            Self::ControllerResponses => "controller_responses",
        }
    }

    /// Parse a lane name. Unknown names return `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "high" => Some(Self::High),
            "default" => Some(Self::Default),
            "low" => Some(Self::Low),
            "worker_requests" => Some(Self::WorkerRequests),
            "controller_responses" => Some(Self::ControllerResponses),
            _ => None,
        }
    }

    /// The lane a work order of the given priority is enqueued into.
    pub fn for_priority(priority: WorkOrderPriority) -> Self {
        match priority {
            WorkOrderPriority::High => Self::High,
            WorkOrderPriority::Low => Self::Low,
            WorkOrderPriority::Normal => Self::Default,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broker-side status of a job.
///
/// `Deferred` and `Scheduled` exist for stats parity with the upstream
/// broker model; nothing in the core enqueues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Started,
    Finished,
    Failed,
    Deferred,
    Scheduled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata carried by a job, retrievable independent of the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_order_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub enqueued_at: DateTime<Utc>,
}

/// Retention and timeout settings attached at enqueue time.
///
/// Enforcement is the broker's responsibility, not the claimer's.
#[derive(Debug, Clone, Copy)]
pub struct JobRetention {
    pub timeout_secs: u64,
    pub result_ttl_secs: u64,
    pub failure_ttl_secs: u64,
}

/// A job handed to exactly one caller by an atomic dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job_id: String,
    pub lane: Lane,
    pub payload: serde_json::Value,
    pub meta: JobMeta,
}

/// Per-lane job counts, eventually consistent with in-flight claims.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LaneStats {
    pub pending: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub deferred: u64,
    pub scheduled: u64,
}
