//! `Database` trait — single async interface for all relational persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ChatMessage, Session, SessionStatus, Task, TaskStatus, WorkOrder, Worker, WorkerStatus,
};

/// Backend-agnostic database trait covering tasks, work orders, workers,
/// sessions, and chat messages.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// List tasks, newest first, optionally filtered by status.
    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Set a task's status, stamping started/completed timestamps as the
    /// transition requires. Returns the updated task, `None` if unknown.
    async fn set_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Delete a task and (via cascade) its work orders.
    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Work orders ─────────────────────────────────────────────────

    /// Insert a new work order.
    async fn insert_work_order(&self, order: &WorkOrder) -> Result<(), DatabaseError>;

    /// Get a work order by id.
    async fn get_work_order(&self, id: Uuid) -> Result<Option<WorkOrder>, DatabaseError>;

    /// All work orders for a task, oldest first.
    async fn work_orders_for_task(&self, task_id: Uuid) -> Result<Vec<WorkOrder>, DatabaseError>;

    /// Mirror a broker claim onto the work-order row: status claimed,
    /// claiming worker, claim timestamp. Guarded on status = queued.
    async fn mark_work_order_claimed(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError>;

    /// Mark a claimed work order completed.
    async fn mark_work_order_completed(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Mark a work order permanently failed.
    async fn mark_work_order_failed(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Reset a work order to queued for another attempt: increments the
    /// retry counter and clears the claim fields. Returns the updated row.
    async fn requeue_work_order(&self, id: Uuid) -> Result<Option<WorkOrder>, DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Insert a newly registered worker.
    async fn insert_worker(&self, worker: &Worker) -> Result<(), DatabaseError>;

    /// Get a worker by id.
    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, DatabaseError>;

    /// List workers, newest first, optionally filtered by status.
    async fn list_workers(&self, status: Option<WorkerStatus>)
    -> Result<Vec<Worker>, DatabaseError>;

    /// Record a heartbeat: status + last-heartbeat timestamp.
    /// Returns the updated worker, `None` if unknown.
    async fn record_worker_heartbeat(
        &self,
        id: Uuid,
        status: WorkerStatus,
    ) -> Result<Option<Worker>, DatabaseError>;

    /// Remove a worker and (via cascade) its sessions and their messages.
    async fn delete_worker(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert a new session.
    async fn insert_session(&self, session: &Session) -> Result<(), DatabaseError>;

    /// Get a session by database id.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError>;

    /// Get a session by its external identifier.
    async fn get_session_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Session>, DatabaseError>;

    /// List sessions, optionally filtered by status.
    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, DatabaseError>;

    /// Record activity on a session: status active, fresh last-activity
    /// timestamp, and first-write-wins task attachment. Returns the
    /// updated session, `None` if unknown.
    async fn touch_session(
        &self,
        external_id: &str,
        task_id: Option<Uuid>,
    ) -> Result<Option<Session>, DatabaseError>;

    /// Sweep helper: active → idle, guarded so a concurrent heartbeat
    /// (which bumps last activity) makes the update a no-op.
    async fn mark_session_idle_if_stale(
        &self,
        id: Uuid,
        activity_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Sweep helper: active → terminated once past the lifetime cutoff.
    async fn terminate_session_if_expired(
        &self,
        id: Uuid,
        created_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Sweep helper: idle → terminated once inactive past the grace cutoff.
    async fn terminate_idle_session_if_stale(
        &self,
        id: Uuid,
        activity_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Explicit termination from any state. Returns the updated session.
    async fn terminate_session(
        &self,
        external_id: &str,
    ) -> Result<Option<Session>, DatabaseError>;

    // ── Chat messages ───────────────────────────────────────────────

    /// Insert a chat message. Messages are never mutated afterwards.
    async fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), DatabaseError>;

    /// Get a chat message by id.
    async fn get_chat_message(&self, id: Uuid) -> Result<Option<ChatMessage>, DatabaseError>;

    /// All messages for a session, ordered by creation time ascending.
    async fn session_messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError>;

    /// Worker-to-human messages that are not replies and have received no
    /// reply, newest first, up to `limit`.
    async fn unreplied_worker_messages(
        &self,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, DatabaseError>;
}
