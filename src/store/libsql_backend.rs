//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are stored
//! as RFC 3339 text, so string comparison in SQL matches chronological
//! comparison.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ChatMessage, MessageDirection, Session, SessionStatus, Task, TaskPriority, TaskStatus,
    TaskType, WorkOrder, WorkOrderPriority, WorkOrderStatus, Worker, WorkerStatus,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self { db, conn };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self { db, conn };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        // Cascading deletes rely on foreign keys being enforced.
        let _ = self
            .conn
            .query("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&self.conn).await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_optional_uuid(s: &Option<String>) -> Option<Uuid> {
    s.as_ref().map(|s| parse_uuid(s))
}

fn str_to_task_type(s: &str) -> TaskType {
    match s {
        "bugfix" => TaskType::Bugfix,
        "test" => TaskType::Test,
        "docs" => TaskType::Docs,
        "refactor" => TaskType::Refactor,
        "review" => TaskType::Review,
        _ => TaskType::Feature,
    }
}

fn str_to_task_status(s: &str) -> TaskStatus {
    match s {
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Queued,
    }
}

fn str_to_task_priority(s: &str) -> TaskPriority {
    match s {
        "low" => TaskPriority::Low,
        "high" => TaskPriority::High,
        "critical" => TaskPriority::Critical,
        _ => TaskPriority::Normal,
    }
}

fn str_to_order_status(s: &str) -> WorkOrderStatus {
    match s {
        "claimed" => WorkOrderStatus::Claimed,
        "completed" => WorkOrderStatus::Completed,
        "failed" => WorkOrderStatus::Failed,
        _ => WorkOrderStatus::Queued,
    }
}

fn str_to_order_priority(s: &str) -> WorkOrderPriority {
    match s {
        "low" => WorkOrderPriority::Low,
        "high" => WorkOrderPriority::High,
        _ => WorkOrderPriority::Normal,
    }
}

fn str_to_session_status(s: &str) -> SessionStatus {
    match s {
        "idle" => SessionStatus::Idle,
        "terminated" => SessionStatus::Terminated,
        _ => SessionStatus::Active,
    }
}

fn str_to_worker_status(s: &str) -> WorkerStatus {
    match s {
        "busy" => WorkerStatus::Busy,
        "waiting" => WorkerStatus::Waiting,
        "error" => WorkerStatus::Error,
        "offline" => WorkerStatus::Offline,
        _ => WorkerStatus::Idle,
    }
}

fn str_to_direction(s: &str) -> MessageDirection {
    match s {
        "human_to_worker" => MessageDirection::HumanToWorker,
        _ => MessageDirection::WorkerToHuman,
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, title, description, task_type, status, priority, repository_url, branch_name, created_at, updated_at, started_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    Ok(Task {
        id: parse_uuid(&row.get::<String>(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        task_type: str_to_task_type(&row.get::<String>(3)?),
        status: str_to_task_status(&row.get::<String>(4)?),
        priority: str_to_task_priority(&row.get::<String>(5)?),
        repository_url: row.get(6)?,
        branch_name: row.get(7)?,
        created_at: parse_datetime(&row.get::<String>(8)?),
        updated_at: parse_datetime(&row.get::<String>(9)?),
        started_at: parse_optional_datetime(&row.get::<String>(10).ok()),
        completed_at: parse_optional_datetime(&row.get::<String>(11).ok()),
    })
}

const WORK_ORDER_COLUMNS: &str =
    "id, task_id, worker_id, status, priority, retry_count, enqueued_at, claimed_at, completed_at";

fn row_to_work_order(row: &libsql::Row) -> Result<WorkOrder, libsql::Error> {
    Ok(WorkOrder {
        id: parse_uuid(&row.get::<String>(0)?),
        task_id: parse_uuid(&row.get::<String>(1)?),
        worker_id: parse_optional_uuid(&row.get::<String>(2).ok()),
        status: str_to_order_status(&row.get::<String>(3)?),
        priority: str_to_order_priority(&row.get::<String>(4)?),
        retry_count: row.get::<i64>(5)? as u32,
        enqueued_at: parse_datetime(&row.get::<String>(6)?),
        claimed_at: parse_optional_datetime(&row.get::<String>(7).ok()),
        completed_at: parse_optional_datetime(&row.get::<String>(8).ok()),
    })
}

const WORKER_COLUMNS: &str = "id, name, status, created_at, updated_at, last_heartbeat_at";

fn row_to_worker(row: &libsql::Row) -> Result<Worker, libsql::Error> {
    Ok(Worker {
        id: parse_uuid(&row.get::<String>(0)?),
        name: row.get(1)?,
        status: str_to_worker_status(&row.get::<String>(2)?),
        created_at: parse_datetime(&row.get::<String>(3)?),
        updated_at: parse_datetime(&row.get::<String>(4)?),
        last_heartbeat_at: parse_optional_datetime(&row.get::<String>(5).ok()),
    })
}

const SESSION_COLUMNS: &str =
    "id, external_id, worker_id, task_id, status, created_at, last_activity_at, terminated_at";

fn row_to_session(row: &libsql::Row) -> Result<Session, libsql::Error> {
    Ok(Session {
        id: parse_uuid(&row.get::<String>(0)?),
        external_id: row.get(1)?,
        worker_id: parse_uuid(&row.get::<String>(2)?),
        task_id: parse_optional_uuid(&row.get::<String>(3).ok()),
        status: str_to_session_status(&row.get::<String>(4)?),
        created_at: parse_datetime(&row.get::<String>(5)?),
        last_activity_at: parse_datetime(&row.get::<String>(6)?),
        terminated_at: parse_optional_datetime(&row.get::<String>(7).ok()),
    })
}

const CHAT_COLUMNS: &str =
    "id, session_id, direction, content, sender_worker_id, in_reply_to, created_at";

fn row_to_chat_message(row: &libsql::Row) -> Result<ChatMessage, libsql::Error> {
    Ok(ChatMessage {
        id: parse_uuid(&row.get::<String>(0)?),
        session_id: parse_uuid(&row.get::<String>(1)?),
        direction: str_to_direction(&row.get::<String>(2)?),
        content: row.get(3)?,
        sender_worker_id: parse_optional_uuid(&row.get::<String>(4).ok()),
        in_reply_to: parse_optional_uuid(&row.get::<String>(5).ok()),
        created_at: parse_datetime(&row.get::<String>(6)?),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (id, title, description, task_type, status, priority, repository_url, branch_name, created_at, updated_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.id.to_string(),
                    task.title.clone(),
                    task.description.clone(),
                    task.task_type.to_string(),
                    task.status.to_string(),
                    task.priority.to_string(),
                    task.repository_url.clone(),
                    task.branch_name.clone(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_task(&row).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
                    ),
                    params![status.to_string(), limit as i64, offset as i64],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
                    ),
                    params![limit as i64, offset as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn set_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let sql = match status {
            TaskStatus::InProgress => {
                "UPDATE tasks SET status = ?2, updated_at = ?3, started_at = COALESCE(started_at, ?3) WHERE id = ?1"
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                "UPDATE tasks SET status = ?2, updated_at = ?3, completed_at = ?3 WHERE id = ?1"
            }
            TaskStatus::Queued => "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
        };

        let changed = self
            .conn()
            .execute(sql, params![id.to_string(), status.to_string(), now])
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_status: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_task(id).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(changed > 0)
    }

    // ── Work orders ─────────────────────────────────────────────────

    async fn insert_work_order(&self, order: &WorkOrder) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO work_orders (id, task_id, worker_id, status, priority, retry_count, enqueued_at, claimed_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    order.id.to_string(),
                    order.task_id.to_string(),
                    order.worker_id.map(|id| id.to_string()),
                    order.status.to_string(),
                    order.priority.to_string(),
                    order.retry_count as i64,
                    order.enqueued_at.to_rfc3339(),
                    order.claimed_at.map(|t| t.to_rfc3339()),
                    order.completed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_work_order: {e}")))?;
        Ok(())
    }

    async fn get_work_order(&self, id: Uuid) -> Result<Option<WorkOrder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORK_ORDER_COLUMNS} FROM work_orders WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_work_order: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_work_order(&row).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_work_order: {e}"))),
        }
    }

    async fn work_orders_for_task(&self, task_id: Uuid) -> Result<Vec<WorkOrder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {WORK_ORDER_COLUMNS} FROM work_orders WHERE task_id = ?1 ORDER BY enqueued_at ASC, rowid ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("work_orders_for_task: {e}")))?;

        let mut orders = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_work_order(&row) {
                Ok(order) => orders.push(order),
                Err(e) => tracing::warn!("Skipping work order row: {e}"),
            }
        }
        Ok(orders)
    }

    async fn mark_work_order_claimed(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE work_orders SET status = 'claimed', worker_id = ?2, claimed_at = ?3 WHERE id = ?1 AND status = 'queued'",
                params![
                    id.to_string(),
                    worker_id.map(|id| id.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_work_order_claimed: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_work_order_completed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE work_orders SET status = 'completed', completed_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_work_order_completed: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_work_order_failed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE work_orders SET status = 'failed', completed_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_work_order_failed: {e}")))?;
        Ok(changed > 0)
    }

    async fn requeue_work_order(&self, id: Uuid) -> Result<Option<WorkOrder>, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE work_orders SET status = 'queued', retry_count = retry_count + 1, worker_id = NULL, claimed_at = NULL WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_work_order: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_work_order(id).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workers (id, name, status, created_at, updated_at, last_heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    worker.id.to_string(),
                    worker.name.clone(),
                    worker.status.to_string(),
                    worker.created_at.to_rfc3339(),
                    worker.updated_at.to_rfc3339(),
                    worker.last_heartbeat_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_worker: {e}")))?;
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_worker(&row).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_worker: {e}"))),
        }
    }

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<Worker>, DatabaseError> {
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {WORKER_COLUMNS} FROM workers WHERE status = ?1 ORDER BY created_at DESC, rowid DESC"
                    ),
                    params![status.to_string()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at DESC, rowid DESC"
                    ),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_worker(&row) {
                Ok(worker) => workers.push(worker),
                Err(e) => tracing::warn!("Skipping worker row: {e}"),
            }
        }
        Ok(workers)
    }

    async fn record_worker_heartbeat(
        &self,
        id: Uuid,
        status: WorkerStatus,
    ) -> Result<Option<Worker>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE workers SET status = ?2, updated_at = ?3, last_heartbeat_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_worker_heartbeat: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_worker(id).await
    }

    async fn delete_worker(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM workers WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_worker: {e}")))?;
        Ok(changed > 0)
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &Session) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sessions (id, external_id, worker_id, task_id, status, created_at, last_activity_at, terminated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    session.id.to_string(),
                    session.external_id.clone(),
                    session.worker_id.to_string(),
                    session.task_id.map(|id| id.to_string()),
                    session.status.to_string(),
                    session.created_at.to_rfc3339(),
                    session.last_activity_at.to_rfc3339(),
                    session.terminated_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("session {}: {msg}", session.external_id))
                } else {
                    DatabaseError::Query(format!("insert_session: {msg}"))
                }
            })?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_session(&row).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session: {e}"))),
        }
    }

    async fn get_session_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_session(&row).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_session_by_external_id: {e}"
            ))),
        }
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, DatabaseError> {
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY created_at DESC, rowid DESC"
                    ),
                    params![status.to_string()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC, rowid DESC"
                    ),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_sessions: {e}")))?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_session(&row) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("Skipping session row: {e}"),
            }
        }
        Ok(sessions)
    }

    async fn touch_session(
        &self,
        external_id: &str,
        task_id: Option<Uuid>,
    ) -> Result<Option<Session>, DatabaseError> {
        // COALESCE keeps the first attached task: a later differing task id
        // never overwrites it.
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'active', last_activity_at = ?2, task_id = COALESCE(task_id, ?3) WHERE external_id = ?1",
                params![
                    external_id,
                    Utc::now().to_rfc3339(),
                    task_id.map(|id| id.to_string()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_session: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_session_by_external_id(external_id).await
    }

    async fn mark_session_idle_if_stale(
        &self,
        id: Uuid,
        activity_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'idle' WHERE id = ?1 AND status = 'active' AND last_activity_at < ?2",
                params![id.to_string(), activity_cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_session_idle_if_stale: {e}")))?;
        Ok(changed > 0)
    }

    async fn terminate_session_if_expired(
        &self,
        id: Uuid,
        created_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'terminated', terminated_at = ?3 WHERE id = ?1 AND status = 'active' AND created_at < ?2",
                params![
                    id.to_string(),
                    created_cutoff.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("terminate_session_if_expired: {e}")))?;
        Ok(changed > 0)
    }

    async fn terminate_idle_session_if_stale(
        &self,
        id: Uuid,
        activity_cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'terminated', terminated_at = ?3 WHERE id = ?1 AND status = 'idle' AND last_activity_at < ?2",
                params![
                    id.to_string(),
                    activity_cutoff.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("terminate_idle_session_if_stale: {e}")))?;
        Ok(changed > 0)
    }

    async fn terminate_session(
        &self,
        external_id: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sessions SET status = 'terminated', terminated_at = ?2 WHERE external_id = ?1",
                params![external_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("terminate_session: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_session_by_external_id(external_id).await
    }

    // ── Chat messages ───────────────────────────────────────────────

    async fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO chat_messages (id, session_id, direction, content, sender_worker_id, in_reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.to_string(),
                    message.session_id.to_string(),
                    message.direction.to_string(),
                    message.content.clone(),
                    message.sender_worker_id.map(|id| id.to_string()),
                    message.in_reply_to.map(|id| id.to_string()),
                    message.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_chat_message: {e}")))?;
        Ok(())
    }

    async fn get_chat_message(&self, id: Uuid) -> Result<Option<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CHAT_COLUMNS} FROM chat_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_chat_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_chat_message(&row)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_chat_message: {e}"))),
        }
    }

    async fn session_messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHAT_COLUMNS} FROM chat_messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![session_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("session_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_chat_message(&row) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping chat message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn unreplied_worker_messages(
        &self,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHAT_COLUMNS} FROM chat_messages m
                     WHERE m.direction = 'worker_to_human'
                       AND m.in_reply_to IS NULL
                       AND NOT EXISTS (SELECT 1 FROM chat_messages r WHERE r.in_reply_to = m.id)
                     ORDER BY m.created_at DESC, m.rowid DESC
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unreplied_worker_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_chat_message(&row) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping chat message row: {e}"),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(priority: TaskPriority) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            title: "Fix login flow".to_string(),
            description: "Session cookie is dropped on redirect".to_string(),
            task_type: TaskType::Bugfix,
            status: TaskStatus::Queued,
            priority,
            repository_url: "https://example.com/repo.git".to_string(),
            branch_name: "fix/login".to_string(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn make_order(task_id: Uuid) -> WorkOrder {
        WorkOrder {
            id: Uuid::new_v4(),
            task_id,
            worker_id: None,
            status: WorkOrderStatus::Queued,
            priority: WorkOrderPriority::Normal,
            retry_count: 0,
            enqueued_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
        }
    }

    fn make_worker(name: &str) -> Worker {
        let now = Utc::now();
        Worker {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: WorkerStatus::Idle,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: Some(now),
        }
    }

    fn make_session(worker_id: Uuid, external_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            worker_id,
            task_id: None,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            terminated_at: None,
        }
    }

    fn make_message(session_id: Uuid, direction: MessageDirection, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            session_id,
            direction,
            content: content.to_string(),
            sender_worker_id: None,
            in_reply_to: None,
            created_at: Utc::now(),
        }
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = test_db().await;
        let task = make_task(TaskPriority::Normal);
        db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Fix login flow");
        assert_eq!(fetched.task_type, TaskType::Bugfix);
        assert_eq!(fetched.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn set_task_status_stamps_timestamps() {
        let db = test_db().await;
        let task = make_task(TaskPriority::High);
        db.insert_task(&task).await.unwrap();

        let started = db
            .set_task_status(task.id, TaskStatus::InProgress)
            .await
            .unwrap()
            .unwrap();
        assert!(started.started_at.is_some());
        assert!(started.completed_at.is_none());

        let done = db
            .set_task_status(task.id, TaskStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert!(done.completed_at.is_some());
        // started_at survives the second transition
        assert_eq!(done.started_at, started.started_at);
    }

    #[tokio::test]
    async fn set_task_status_unknown_returns_none() {
        let db = test_db().await;
        let result = db
            .set_task_status(Uuid::new_v4(), TaskStatus::Completed)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn list_tasks_filters_and_orders() {
        let db = test_db().await;
        let mut done = make_task(TaskPriority::Low);
        done.status = TaskStatus::Completed;
        db.insert_task(&done).await.unwrap();
        db.insert_task(&make_task(TaskPriority::Normal)).await.unwrap();

        let all = db.list_tasks(None, 100, 0).await.unwrap();
        assert_eq!(all.len(), 2);

        let queued = db.list_tasks(Some(TaskStatus::Queued), 100, 0).await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    // ── Work order tests ────────────────────────────────────────────

    #[tokio::test]
    async fn work_order_claim_mirror_is_guarded() {
        let db = test_db().await;
        let task = make_task(TaskPriority::Normal);
        db.insert_task(&task).await.unwrap();
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let order = make_order(task.id);
        db.insert_work_order(&order).await.unwrap();

        assert!(
            db.mark_work_order_claimed(order.id, Some(worker.id))
                .await
                .unwrap()
        );
        // Second claim mirror is a no-op: the row is no longer queued.
        assert!(
            !db.mark_work_order_claimed(order.id, Some(worker.id))
                .await
                .unwrap()
        );

        let fetched = db.get_work_order(order.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkOrderStatus::Claimed);
        assert_eq!(fetched.worker_id, Some(worker.id));
        assert!(fetched.claimed_at.is_some());
    }

    #[tokio::test]
    async fn requeue_increments_retry_and_clears_claim() {
        let db = test_db().await;
        let task = make_task(TaskPriority::Normal);
        db.insert_task(&task).await.unwrap();
        let order = make_order(task.id);
        db.insert_work_order(&order).await.unwrap();
        db.mark_work_order_claimed(order.id, None).await.unwrap();

        let requeued = db.requeue_work_order(order.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, WorkOrderStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.claimed_at.is_none());
    }

    #[tokio::test]
    async fn deleting_task_cascades_to_work_orders() {
        let db = test_db().await;
        let task = make_task(TaskPriority::Normal);
        db.insert_task(&task).await.unwrap();
        let order = make_order(task.id);
        db.insert_work_order(&order).await.unwrap();

        assert!(db.delete_task(task.id).await.unwrap());
        assert!(db.get_work_order(order.id).await.unwrap().is_none());
    }

    // ── Worker tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn heartbeat_updates_status_and_timestamp() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();

        let updated = db
            .record_worker_heartbeat(worker.id, WorkerStatus::Busy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, WorkerStatus::Busy);
        assert!(updated.last_heartbeat_at.unwrap() >= worker.last_heartbeat_at.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_returns_none() {
        let db = test_db().await;
        let result = db
            .record_worker_heartbeat(Uuid::new_v4(), WorkerStatus::Idle)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    // ── Session tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn touch_attaches_task_first_write_wins() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let task_a = make_task(TaskPriority::Normal);
        let task_b = make_task(TaskPriority::Normal);
        db.insert_task(&task_a).await.unwrap();
        db.insert_task(&task_b).await.unwrap();

        db.insert_session(&make_session(worker.id, "sess-1")).await.unwrap();

        let touched = db
            .touch_session("sess-1", Some(task_a.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.task_id, Some(task_a.id));

        // A differing task id on a later touch is ignored.
        let touched_again = db
            .touch_session("sess-1", Some(task_b.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched_again.task_id, Some(task_a.id));
    }

    #[tokio::test]
    async fn touch_reactivates_idle_session() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let session = make_session(worker.id, "sess-1");
        db.insert_session(&session).await.unwrap();

        db.mark_session_idle_if_stale(session.id, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        let touched = db.touch_session("sess-1", None).await.unwrap().unwrap();
        assert_eq!(touched.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn idle_guard_respects_recent_activity() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let session = make_session(worker.id, "sess-1");
        db.insert_session(&session).await.unwrap();

        // Cutoff in the past — the session has recent activity, so no-op.
        let stale_cutoff = Utc::now() - Duration::minutes(30);
        assert!(
            !db.mark_session_idle_if_stale(session.id, stale_cutoff)
                .await
                .unwrap()
        );

        // Cutoff in the future — activity is older than it, so it idles.
        let future_cutoff = Utc::now() + Duration::minutes(1);
        assert!(
            db.mark_session_idle_if_stale(session.id, future_cutoff)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn terminate_from_any_state() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let session = make_session(worker.id, "sess-1");
        db.insert_session(&session).await.unwrap();

        let terminated = db.terminate_session("sess-1").await.unwrap().unwrap();
        assert_eq!(terminated.status, SessionStatus::Terminated);
        assert!(terminated.terminated_at.is_some());

        assert!(db.terminate_session("sess-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_external_id_is_a_constraint_error() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        db.insert_session(&make_session(worker.id, "sess-1")).await.unwrap();

        let dup = db.insert_session(&make_session(worker.id, "sess-1")).await;
        assert!(dup.is_err());
    }

    // ── Chat message tests ──────────────────────────────────────────

    #[tokio::test]
    async fn conversation_is_ordered_by_creation() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let session = make_session(worker.id, "sess-1");
        db.insert_session(&session).await.unwrap();

        for content in ["first", "second", "third"] {
            db.insert_chat_message(&make_message(
                session.id,
                MessageDirection::WorkerToHuman,
                content,
            ))
            .await
            .unwrap();
        }

        let messages = db.session_messages(session.id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn unreplied_excludes_answered_and_human_messages() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let session = make_session(worker.id, "sess-1");
        db.insert_session(&session).await.unwrap();

        let answered = make_message(session.id, MessageDirection::WorkerToHuman, "answered");
        let open = make_message(session.id, MessageDirection::WorkerToHuman, "open");
        db.insert_chat_message(&answered).await.unwrap();
        db.insert_chat_message(&open).await.unwrap();

        let mut reply = make_message(session.id, MessageDirection::HumanToWorker, "the answer");
        reply.in_reply_to = Some(answered.id);
        db.insert_chat_message(&reply).await.unwrap();

        let pending = db.unreplied_worker_messages(50).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);
    }

    #[tokio::test]
    async fn file_backed_db_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.db");

        let task = make_task(TaskPriority::Normal);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_task(&task).await.unwrap();
        }

        // Reopen: migrations are idempotent and the data is still there.
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, task.title);
    }

    #[tokio::test]
    async fn deleting_worker_cascades_to_sessions_and_messages() {
        let db = test_db().await;
        let worker = make_worker("w1");
        db.insert_worker(&worker).await.unwrap();
        let session = make_session(worker.id, "sess-1");
        db.insert_session(&session).await.unwrap();
        let message = make_message(session.id, MessageDirection::WorkerToHuman, "hello");
        db.insert_chat_message(&message).await.unwrap();

        assert!(db.delete_worker(worker.id).await.unwrap());
        assert!(db.get_session(session.id).await.unwrap().is_none());
        assert!(db.get_chat_message(message.id).await.unwrap().is_none());
    }
}
