//! Queue manager — lane selection, enqueue metadata, and the ordered
//! multi-lane claim algorithm on top of the broker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::QueueError;
use crate::model::{TaskType, WorkOrderPriority};
use crate::queue::broker::JobBroker;
use crate::queue::job::{ClaimedJob, JobMeta, JobRetention, Lane, LaneStats};

/// Retention for work-order jobs: 1 h timeout, results kept 24 h,
/// failures kept 7 d.
const WORK_ORDER_RETENTION: JobRetention = JobRetention {
    timeout_secs: 3600,
    result_ttl_secs: 86_400,
    failure_ttl_secs: 604_800,
};

/// Retention for worker clarification requests: 30 min timeout, kept 1 h.
const WORKER_REQUEST_RETENTION: JobRetention = JobRetention {
    timeout_secs: 1800,
    result_ttl_secs: 3600,
    failure_ttl_secs: 3600,
};

/// Retention for controller responses: 5 min timeout, kept 1 h.
const CONTROLLER_RESPONSE_RETENTION: JobRetention = JobRetention {
    timeout_secs: 300,
    result_ttl_secs: 3600,
    failure_ttl_secs: 3600,
};

/// Payload of a work-order job: everything a worker needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderPayload {
    pub task_id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub repository_url: String,
    pub branch_name: String,
}

/// Notification pushed to the `worker_requests` lane when a worker asks
/// the human reviewer for clarification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequestNotice {
    /// Id of the persisted chat message.
    pub request_id: Uuid,
    pub external_session_id: String,
    pub worker_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_order_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Notification pushed to the `controller_responses` lane when a human
/// reply is routed back to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerResponseNotice {
    /// Id of the persisted reply message.
    pub response_id: Uuid,
    /// Id of the worker message being answered.
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_session_id: Option<String>,
    pub message: String,
    pub generated_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Queue service constructed once at process start and shared by every
/// consumer.
pub struct QueueManager {
    broker: Arc<JobBroker>,
}

impl QueueManager {
    pub fn new(broker: Arc<JobBroker>) -> Self {
        Self { broker }
    }

    /// Enqueue a work order into the lane matching its priority. The
    /// broker job id for the first attempt is the work order id itself.
    pub async fn enqueue_work_order(
        &self,
        work_order_id: Uuid,
        payload: &WorkOrderPayload,
        priority: WorkOrderPriority,
    ) -> Result<String, QueueError> {
        self.enqueue_work_order_attempt(&work_order_id.to_string(), work_order_id, payload, priority)
            .await
    }

    /// Enqueue a specific attempt of a work order under an explicit job id.
    /// Used by the retry path, where each attempt must be a distinct
    /// broker job.
    pub async fn enqueue_work_order_attempt(
        &self,
        job_id: &str,
        work_order_id: Uuid,
        payload: &WorkOrderPayload,
        priority: WorkOrderPriority,
    ) -> Result<String, QueueError> {
        let lane = Lane::for_priority(priority);
        let meta = JobMeta {
            work_order_id: Some(work_order_id),
            task_id: Some(payload.task_id),
            enqueued_at: Utc::now(),
        };
        self.broker
            .enqueue(
                job_id,
                lane,
                &serde_json::to_value(payload)?,
                &meta,
                WORK_ORDER_RETENTION,
            )
            .await
    }

    /// Push a worker clarification request onto the `worker_requests` lane.
    pub async fn enqueue_worker_request(
        &self,
        notice: &WorkerRequestNotice,
    ) -> Result<String, QueueError> {
        let meta = JobMeta {
            work_order_id: notice.work_order_id,
            task_id: notice.task_id,
            enqueued_at: Utc::now(),
        };
        self.broker
            .enqueue(
                &notice.request_id.to_string(),
                Lane::WorkerRequests,
                &serde_json::to_value(notice)?,
                &meta,
                WORKER_REQUEST_RETENTION,
            )
            .await
    }

    /// Push a human reply onto the `controller_responses` lane.
    pub async fn enqueue_controller_response(
        &self,
        notice: &ControllerResponseNotice,
    ) -> Result<String, QueueError> {
        let meta = JobMeta {
            work_order_id: None,
            task_id: None,
            enqueued_at: Utc::now(),
        };
        self.broker
            .enqueue(
                &notice.response_id.to_string(),
                Lane::ControllerResponses,
                &serde_json::to_value(notice)?,
                &meta,
                CONTROLLER_RESPONSE_RETENTION,
            )
            .await
    }

    /// Claim the next available job, checking lanes in the caller's order.
    ///
    /// One non-blocking dequeue attempt per lane. A lane fault is treated
    /// as empty and iteration continues; unknown lane names are skipped.
    /// Returns `None` when every lane is empty or erroring.
    pub async fn claim_work(&self, lane_names: &[String]) -> Option<ClaimedJob> {
        for name in lane_names {
            let Some(lane) = Lane::parse(name) else {
                warn!(lane = %name, "Skipping unknown lane in claim order");
                continue;
            };
            match self.broker.claim_one(lane).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => continue,
                Err(e) => {
                    warn!(lane = %lane, error = %e, "Lane claim failed, trying next");
                    continue;
                }
            }
        }
        None
    }

    /// Per-lane statistics.
    pub async fn stats(&self) -> Result<Vec<(Lane, LaneStats)>, QueueError> {
        self.broker.lane_stats().await
    }

    /// Mark a claimed job finished in the broker.
    pub async fn complete_job(&self, job_id: &str) -> Result<(), QueueError> {
        self.broker.complete(job_id).await
    }

    /// Mark a claimed job failed in the broker.
    pub async fn fail_job(&self, job_id: &str) -> Result<(), QueueError> {
        self.broker.fail(job_id).await
    }

    /// Drop jobs whose retention has elapsed.
    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        self.broker.purge_expired().await
    }
}
