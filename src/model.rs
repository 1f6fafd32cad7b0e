//! Domain entities and their status enumerations.
//!
//! Every status/priority field is a closed enum. Transition sites match
//! exhaustively; the store round-trips them through their snake_case
//! string forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Tasks ───────────────────────────────────────────────────────────

/// Kind of development task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Test,
    Docs,
    Refactor,
    Review,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Test => "test",
            Self::Docs => "docs",
            Self::Refactor => "refactor",
            Self::Review => "review",
        };
        write!(f, "{s}")
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Priority of a task as submitted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// A development task submitted for worker execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub repository_url: String,
    pub branch_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Work orders ─────────────────────────────────────────────────────

/// Status of a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Queued,
    Claimed,
    Completed,
    Failed,
}

impl WorkOrderStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Priority of a work order. Tasks map onto three broker lanes, so
/// `critical` collapses into `high` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderPriority {
    Low,
    Normal,
    High,
}

impl From<TaskPriority> for WorkOrderPriority {
    fn from(p: TaskPriority) -> Self {
        match p {
            TaskPriority::Low => Self::Low,
            TaskPriority::Normal => Self::Normal,
            TaskPriority::High | TaskPriority::Critical => Self::High,
        }
    }
}

impl std::fmt::Display for WorkOrderPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// One queued execution request for a task.
///
/// At most one worker ever holds a claim: the queued→claimed transition is
/// performed by the broker's atomic dequeue, and the row here only mirrors
/// it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub status: WorkOrderStatus,
    pub priority: WorkOrderPriority,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Sessions ────────────────────────────────────────────────────────

/// Status of a worker execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// A worker's continuous execution context, keyed by an external id.
///
/// Task association is first-write-wins: once `task_id` is set it is never
/// overwritten by a later differing value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// External session identifier (unique).
    pub external_id: String,
    pub worker_id: Uuid,
    pub task_id: Option<Uuid>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

// ── Chat messages ───────────────────────────────────────────────────

/// Direction of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    WorkerToHuman,
    HumanToWorker,
}

impl std::fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WorkerToHuman => "worker_to_human",
            Self::HumanToWorker => "human_to_worker",
        };
        write!(f, "{s}")
    }
}

/// One turn in a worker/human conversation, anchored to a session.
///
/// Messages form a reply forest: `in_reply_to` references at most one
/// earlier message. A message is pending iff it is worker_to_human, has no
/// `in_reply_to`, and no later message references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    /// Owning session's database id (not the external id).
    pub session_id: Uuid,
    pub direction: MessageDirection,
    pub content: String,
    pub sender_worker_id: Option<Uuid>,
    pub in_reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ── Workers ─────────────────────────────────────────────────────────

/// Status of a worker agent.
///
/// `Waiting` and `Offline` are reserved; the agent loop only drives
/// idle/busy/error today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Waiting,
    Error,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// A registered worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_priority_maps_to_high_lane_priority() {
        assert_eq!(
            WorkOrderPriority::from(TaskPriority::Critical),
            WorkOrderPriority::High
        );
        assert_eq!(
            WorkOrderPriority::from(TaskPriority::Normal),
            WorkOrderPriority::Normal
        );
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(WorkOrderStatus::Failed.is_terminal());
        assert!(!WorkOrderStatus::Claimed.is_terminal());
    }

    #[test]
    fn status_display_matches_serde_form() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, format!("\"{}\"", TaskStatus::InProgress));
        let json = serde_json::to_string(&MessageDirection::WorkerToHuman).unwrap();
        assert_eq!(json, format!("\"{}\"", MessageDirection::WorkerToHuman));
    }
}
