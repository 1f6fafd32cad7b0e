//! Pluggable task execution.
//!
//! The agent loop never interprets task content itself — it hands the
//! claimed work order to a `TaskRunner` and reports the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::agent::client::ControlPlane;
use crate::error::AgentError;
use crate::queue::WorkOrderPayload;

/// What a runner gets besides the order: its identity, its session, and a
/// channel to ask the human reviewer for clarification.
pub struct TaskContext {
    pub worker_id: Uuid,
    pub external_session_id: String,
    pub control: Arc<dyn ControlPlane>,
}

impl TaskContext {
    /// Route a clarification question to the human reviewer.
    pub async fn ask_human(&self, question: &str, task_id: Uuid) -> Result<(), AgentError> {
        self.control
            .send_worker_message(
                &self.external_session_id,
                self.worker_id,
                question,
                Some(task_id),
            )
            .await
    }
}

/// Executes one claimed work order to completion.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run the task. `Ok` is reported as completed, `Err` as failed.
    async fn run(&self, order: &WorkOrderPayload, ctx: &TaskContext) -> anyhow::Result<String>;
}

/// Stand-in runner: logs the order and simulates work.
pub struct SimulationRunner {
    pub work_duration: Duration,
}

impl Default for SimulationRunner {
    fn default() -> Self {
        Self {
            work_duration: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl TaskRunner for SimulationRunner {
    async fn run(&self, order: &WorkOrderPayload, _ctx: &TaskContext) -> anyhow::Result<String> {
        info!(
            task_id = %order.task_id,
            title = %order.title,
            repository = %order.repository_url,
            branch = %order.branch_name,
            task_type = %order.task_type,
            "Simulating task execution"
        );
        tokio::time::sleep(self.work_duration).await;
        Ok(format!("simulated: {}", order.title))
    }
}
