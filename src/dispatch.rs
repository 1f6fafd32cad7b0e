//! Task intake and work-order bookkeeping.
//!
//! Creating a task persists it together with its work order and enqueues
//! the order into the lane matching its priority. Status updates reported
//! by workers cascade onto the work order, including the bounded retry
//! policy: a failed order is re-enqueued with its retry counter bumped
//! until `max_retries` re-enqueues are exhausted, then fails permanently.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::model::{
    Task, TaskPriority, TaskStatus, TaskType, WorkOrder, WorkOrderStatus, Worker, WorkerStatus,
};
use crate::queue::{ClaimedJob, QueueManager, WorkOrderPayload};
use crate::store::Database;

/// Task creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub repository_url: String,
    pub branch_name: String,
}

/// Control-plane service for tasks, work orders, and the worker registry.
pub struct Dispatcher {
    db: Arc<dyn Database>,
    queue: Arc<QueueManager>,
    max_retries: u32,
}

/// Broker job id for a work order's current attempt. The first attempt
/// uses the bare order id; retries get a suffix so each attempt is a
/// distinct broker job.
fn job_id_for(order: &WorkOrder) -> String {
    if order.retry_count == 0 {
        order.id.to_string()
    } else {
        format!("{}:{}", order.id, order.retry_count)
    }
}

fn payload_for(task: &Task) -> WorkOrderPayload {
    WorkOrderPayload {
        task_id: task.id,
        title: task.title.clone(),
        description: task.description.clone(),
        task_type: task.task_type,
        repository_url: task.repository_url.clone(),
        branch_name: task.branch_name.clone(),
    }
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, queue: Arc<QueueManager>, max_retries: u32) -> Self {
        Self {
            db,
            queue,
            max_retries,
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Create a task, its work order, and the queued broker job.
    pub async fn create_task(&self, new: NewTask) -> Result<(Task, WorkOrder), DispatchError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            title: new.title,
            description: new.description,
            task_type: new.task_type,
            status: TaskStatus::Queued,
            priority: new.priority,
            repository_url: new.repository_url,
            branch_name: new.branch_name,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.db.insert_task(&task).await?;

        let order = WorkOrder {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: None,
            status: WorkOrderStatus::Queued,
            priority: task.priority.into(),
            retry_count: 0,
            enqueued_at: now,
            claimed_at: None,
            completed_at: None,
        };
        self.db.insert_work_order(&order).await?;

        self.queue
            .enqueue_work_order(order.id, &payload_for(&task), order.priority)
            .await?;

        info!(task_id = %task.id, order_id = %order.id, priority = %task.priority, "Task enqueued");
        Ok((task, order))
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, DispatchError> {
        self.db
            .get_task(id)
            .await?
            .ok_or(DispatchError::TaskNotFound(id))
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Task>, DispatchError> {
        Ok(self.db.list_tasks(status, limit, offset).await?)
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<(), DispatchError> {
        if self.db.delete_task(id).await? {
            Ok(())
        } else {
            Err(DispatchError::TaskNotFound(id))
        }
    }

    /// Apply a status update reported for a task and cascade it onto the
    /// task's current work order.
    pub async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<Task, DispatchError> {
        if status == TaskStatus::Failed {
            return self.handle_task_failure(task_id).await;
        }

        let task = self
            .db
            .set_task_status(task_id, status)
            .await?
            .ok_or(DispatchError::TaskNotFound(task_id))?;

        if status == TaskStatus::Completed {
            if let Some(order) = self.current_order(task_id).await? {
                self.db.mark_work_order_completed(order.id).await?;
                if let Err(e) = self.queue.complete_job(&job_id_for(&order)).await {
                    warn!(order_id = %order.id, error = %e, "Broker completion mark failed");
                }
            }
        }

        Ok(task)
    }

    /// Failure path: re-enqueue while retries remain, otherwise fail the
    /// order and the task permanently.
    async fn handle_task_failure(&self, task_id: Uuid) -> Result<Task, DispatchError> {
        let Some(order) = self.current_order(task_id).await? else {
            return self
                .db
                .set_task_status(task_id, TaskStatus::Failed)
                .await?
                .ok_or(DispatchError::TaskNotFound(task_id));
        };

        if let Err(e) = self.queue.fail_job(&job_id_for(&order)).await {
            warn!(order_id = %order.id, error = %e, "Broker failure mark failed");
        }

        if order.retry_count < self.max_retries {
            let requeued = self
                .db
                .requeue_work_order(order.id)
                .await?
                .ok_or(DispatchError::WorkOrderNotFound(order.id))?;

            let task = self
                .db
                .set_task_status(task_id, TaskStatus::Queued)
                .await?
                .ok_or(DispatchError::TaskNotFound(task_id))?;

            self.queue
                .enqueue_work_order_attempt(
                    &job_id_for(&requeued),
                    requeued.id,
                    &payload_for(&task),
                    requeued.priority,
                )
                .await?;

            info!(
                task_id = %task_id,
                order_id = %order.id,
                retry = requeued.retry_count,
                "Task failed, re-enqueued"
            );
            return Ok(task);
        }

        self.db.mark_work_order_failed(order.id).await?;
        let task = self
            .db
            .set_task_status(task_id, TaskStatus::Failed)
            .await?
            .ok_or(DispatchError::TaskNotFound(task_id))?;
        info!(task_id = %task_id, order_id = %order.id, "Task failed permanently, retries exhausted");
        Ok(task)
    }

    /// The task's active work order: the newest non-terminal one.
    async fn current_order(&self, task_id: Uuid) -> Result<Option<WorkOrder>, DispatchError> {
        let orders = self.db.work_orders_for_task(task_id).await?;
        Ok(orders.into_iter().rev().find(|o| !o.status.is_terminal()))
    }

    // ── Claims ──────────────────────────────────────────────────────

    /// Claim the next job over the given lanes and mirror the claim onto
    /// the work-order row. The broker dequeue is the atomic claim; the
    /// mirror is bookkeeping and never a gate.
    pub async fn claim_work(
        &self,
        lane_names: &[String],
        worker_id: Option<Uuid>,
    ) -> Option<ClaimedJob> {
        let job = self.queue.claim_work(lane_names).await?;

        if let Some(order_id) = job.meta.work_order_id {
            match self.db.mark_work_order_claimed(order_id, worker_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(order_id = %order_id, "Claim mirror found no queued work order row")
                }
                Err(e) => warn!(order_id = %order_id, error = %e, "Claim mirror failed"),
            }
        }

        Some(job)
    }

    // ── Worker registry ─────────────────────────────────────────────

    /// Register a new worker, idle with a fresh heartbeat.
    pub async fn register_worker(&self, name: &str) -> Result<Worker, DispatchError> {
        let now = Utc::now();
        let worker = Worker {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: WorkerStatus::Idle,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: Some(now),
        };
        self.db.insert_worker(&worker).await?;
        info!(worker_id = %worker.id, name, "Worker registered");
        Ok(worker)
    }

    pub async fn get_worker(&self, id: Uuid) -> Result<Worker, DispatchError> {
        self.db
            .get_worker(id)
            .await?
            .ok_or(DispatchError::WorkerNotFound(id))
    }

    pub async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<Worker>, DispatchError> {
        Ok(self.db.list_workers(status).await?)
    }

    /// Record a worker heartbeat.
    pub async fn worker_heartbeat(
        &self,
        id: Uuid,
        status: WorkerStatus,
    ) -> Result<Worker, DispatchError> {
        self.db
            .record_worker_heartbeat(id, status)
            .await?
            .ok_or(DispatchError::WorkerNotFound(id))
    }

    /// Remove a worker registration.
    pub async fn deregister_worker(&self, id: Uuid) -> Result<(), DispatchError> {
        if self.db.delete_worker(id).await? {
            info!(worker_id = %id, "Worker deregistered");
            Ok(())
        } else {
            Err(DispatchError::WorkerNotFound(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobBroker, Lane};
    use crate::store::LibSqlBackend;

    async fn setup(max_retries: u32) -> (Arc<dyn Database>, Arc<QueueManager>, Dispatcher) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let broker = Arc::new(JobBroker::new_memory().await.unwrap());
        let queue = Arc::new(QueueManager::new(broker));
        let dispatcher = Dispatcher::new(Arc::clone(&db), Arc::clone(&queue), max_retries);
        (db, queue, dispatcher)
    }

    fn new_task(priority: TaskPriority) -> NewTask {
        NewTask {
            title: "Add pagination".to_string(),
            description: "List endpoints return everything".to_string(),
            task_type: TaskType::Feature,
            priority,
            repository_url: "https://example.com/repo.git".to_string(),
            branch_name: "main".to_string(),
        }
    }

    fn lanes() -> Vec<String> {
        vec!["high".to_string(), "default".to_string(), "low".to_string()]
    }

    #[tokio::test]
    async fn create_task_enqueues_matching_lane() {
        let (_db, _queue, dispatcher) = setup(3).await;
        let (task, order) = dispatcher
            .create_task(new_task(TaskPriority::Critical))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(order.status, WorkOrderStatus::Queued);

        let job = dispatcher.claim_work(&lanes(), None).await.unwrap();
        assert_eq!(job.lane, Lane::High);
        assert_eq!(job.meta.work_order_id, Some(order.id));
    }

    #[tokio::test]
    async fn claim_mirrors_onto_work_order_row() {
        let (db, _queue, dispatcher) = setup(3).await;
        let worker = dispatcher.register_worker("w1").await.unwrap();
        let (_task, order) = dispatcher
            .create_task(new_task(TaskPriority::Normal))
            .await
            .unwrap();

        dispatcher.claim_work(&lanes(), Some(worker.id)).await.unwrap();

        let mirrored = db.get_work_order(order.id).await.unwrap().unwrap();
        assert_eq!(mirrored.status, WorkOrderStatus::Claimed);
        assert_eq!(mirrored.worker_id, Some(worker.id));
    }

    #[tokio::test]
    async fn completion_cascades_to_work_order() {
        let (db, _queue, dispatcher) = setup(3).await;
        let (task, order) = dispatcher
            .create_task(new_task(TaskPriority::Normal))
            .await
            .unwrap();
        dispatcher.claim_work(&lanes(), None).await.unwrap();

        let updated = dispatcher
            .update_task_status(task.id, TaskStatus::Completed)
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);

        let finished = db.get_work_order(order.id).await.unwrap().unwrap();
        assert_eq!(finished.status, WorkOrderStatus::Completed);
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_requeues_until_retries_exhausted() {
        let (db, _queue, dispatcher) = setup(1).await;
        let (task, order) = dispatcher
            .create_task(new_task(TaskPriority::Normal))
            .await
            .unwrap();

        // First attempt fails: one retry remains, so the task re-queues.
        dispatcher.claim_work(&lanes(), None).await.unwrap();
        let after_first = dispatcher
            .update_task_status(task.id, TaskStatus::Failed)
            .await
            .unwrap();
        assert_eq!(after_first.status, TaskStatus::Queued);

        let requeued = db.get_work_order(order.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, WorkOrderStatus::Queued);
        assert_eq!(requeued.retry_count, 1);

        // The retry attempt is claimable and carries the same order id.
        let retry_job = dispatcher.claim_work(&lanes(), None).await.unwrap();
        assert_eq!(retry_job.meta.work_order_id, Some(order.id));

        // Second failure exhausts the budget: permanent.
        let after_second = dispatcher
            .update_task_status(task.id, TaskStatus::Failed)
            .await
            .unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);

        let failed = db.get_work_order(order.id).await.unwrap().unwrap();
        assert_eq!(failed.status, WorkOrderStatus::Failed);
        assert!(dispatcher.claim_work(&lanes(), None).await.is_none());
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let (_db, _queue, dispatcher) = setup(3).await;
        let err = dispatcher
            .update_task_status(Uuid::new_v4(), TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn worker_registry_round_trip() {
        let (_db, _queue, dispatcher) = setup(3).await;
        let worker = dispatcher.register_worker("w1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);

        let updated = dispatcher
            .worker_heartbeat(worker.id, WorkerStatus::Busy)
            .await
            .unwrap();
        assert_eq!(updated.status, WorkerStatus::Busy);

        dispatcher.deregister_worker(worker.id).await.unwrap();
        let err = dispatcher
            .worker_heartbeat(worker.id, WorkerStatus::Idle)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerNotFound(_)));
    }
}
