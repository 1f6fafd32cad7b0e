//! The worker agent poll loop.
//!
//! Single-threaded: register, then repeat heartbeat → claim → execute.
//! Exactly one task runs at a time, and heartbeats share the loop with
//! execution, so a long task delays the next heartbeat until it returns.
//! Every sleep races the shutdown signal, so stopping the agent never
//! waits out a poll interval.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::client::ControlPlane;
use crate::agent::runner::{TaskContext, TaskRunner};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::model::{TaskStatus, WorkerStatus};
use crate::queue::{ClaimedJob, WorkOrderPayload};

/// One autonomous worker agent.
pub struct WorkerAgent {
    config: AgentConfig,
    control: Arc<dyn ControlPlane>,
    runner: Arc<dyn TaskRunner>,
    shutdown: watch::Receiver<bool>,
}

/// Sleep that returns early when shutdown is signalled.
async fn sleep_cancellable(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    if *shutdown.borrow() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

impl WorkerAgent {
    pub fn new(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        runner: Arc<dyn TaskRunner>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            control,
            runner,
            shutdown,
        }
    }

    /// Run until shutdown. Registration failure is fatal; everything after
    /// that degrades into logged retries and back-off.
    pub async fn run(self) -> Result<(), AgentError> {
        let worker = self
            .control
            .register(&self.config.name)
            .await
            .map_err(|e| AgentError::RegistrationFailed(e.to_string()))?;
        let worker_id = worker.id;
        info!(worker_id = %worker_id, name = %self.config.name, "Worker registered");

        let mut shutdown = self.shutdown.clone();
        let mut status = WorkerStatus::Idle;
        let mut session_external_id: Option<String> = None;

        self.send_heartbeat(worker_id, status).await;
        let mut last_heartbeat = Instant::now();

        while !*shutdown.borrow() {
            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.send_heartbeat(worker_id, status).await;
                last_heartbeat = Instant::now();
            }

            match self
                .control
                .claim_work(&self.config.lanes, worker_id)
                .await
            {
                Ok(Some(job)) => {
                    if status == WorkerStatus::Error {
                        debug!("Recovered from error state");
                    }
                    self.execute(worker_id, job, &mut session_external_id, &mut status)
                        .await;
                }
                Ok(None) => {
                    if status == WorkerStatus::Error {
                        debug!("Recovered from error state");
                        status = WorkerStatus::Idle;
                    }
                    sleep_cancellable(&mut shutdown, self.jittered_poll_interval()).await;
                }
                Err(e) => {
                    // The loop is never aborted by a single fault.
                    error!(error = %e, "Claim failed, backing off");
                    status = WorkerStatus::Error;
                    self.send_heartbeat(worker_id, status).await;
                    last_heartbeat = Instant::now();
                    sleep_cancellable(&mut shutdown, self.config.error_backoff).await;
                }
            }
        }

        info!(worker_id = %worker_id, "Shutting down worker");
        if let Err(e) = self.control.deregister(worker_id).await {
            warn!(error = %e, "Failed to deregister worker");
        }
        info!("Worker shutdown complete");
        Ok(())
    }

    /// Run exactly one claimed job to completion and report its outcome.
    async fn execute(
        &self,
        worker_id: Uuid,
        job: ClaimedJob,
        session_external_id: &mut Option<String>,
        status: &mut WorkerStatus,
    ) {
        *status = WorkerStatus::Busy;

        let payload: WorkOrderPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Undecodable job payload");
                if let Some(task_id) = job.meta.task_id {
                    self.report_task_status(task_id, TaskStatus::Failed).await;
                }
                *status = WorkerStatus::Idle;
                return;
            }
        };
        let task_id = payload.task_id;

        info!(
            task_id = %task_id,
            job_id = %job.job_id,
            lane = %job.lane,
            title = %payload.title,
            "Executing task"
        );
        self.report_task_status(task_id, TaskStatus::InProgress).await;

        // One session per agent lifetime, created with the first task and
        // refreshed afterwards.
        let external_id = match session_external_id {
            Some(id) => {
                if let Err(e) = self.control.session_heartbeat(id).await {
                    warn!(session = %id, error = %e, "Session heartbeat failed");
                }
                id.clone()
            }
            None => {
                let epoch_secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                let id = format!("session-{worker_id}-{epoch_secs}");
                if let Err(e) = self
                    .control
                    .create_session(&id, worker_id, Some(task_id))
                    .await
                {
                    warn!(session = %id, error = %e, "Session create failed (may already exist)");
                }
                *session_external_id = Some(id.clone());
                id
            }
        };

        let ctx = TaskContext {
            worker_id,
            external_session_id: external_id,
            control: Arc::clone(&self.control),
        };

        match self.runner.run(&payload, &ctx).await {
            Ok(summary) => {
                info!(task_id = %task_id, summary = %summary, "Task completed");
                self.report_task_status(task_id, TaskStatus::Completed).await;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task failed");
                self.report_task_status(task_id, TaskStatus::Failed).await;
            }
        }

        *status = WorkerStatus::Idle;
    }

    /// Heartbeat failures are logged and never fatal.
    async fn send_heartbeat(&self, worker_id: Uuid, status: WorkerStatus) {
        match self.control.heartbeat(worker_id, status).await {
            Ok(()) => debug!(status = %status, "Heartbeat sent"),
            Err(e) => warn!(error = %e, "Failed to send heartbeat"),
        }
    }

    /// Status-update failures are logged and never fatal.
    async fn report_task_status(&self, task_id: Uuid, status: TaskStatus) {
        if let Err(e) = self.control.update_task_status(task_id, status).await {
            warn!(task_id = %task_id, status = %status, error = %e, "Failed to report task status");
        }
    }

    /// Poll interval with ±10% jitter so a fleet does not poll in lockstep.
    fn jittered_poll_interval(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(self.config.poll_interval.as_secs_f64() * factor)
    }
}
