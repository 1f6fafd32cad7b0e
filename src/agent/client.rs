//! Control-plane client seam for the worker agent.
//!
//! `ControlPlane` is the boundary to the (transport-owned) HTTP API.
//! `HttpControlPlane` talks to a remote server over reqwest;
//! `LocalControlPlane` wires the same calls straight to the in-process
//! services for single-binary deployments and tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::AgentError;
use crate::model::{TaskStatus, Worker, WorkerStatus};
use crate::orchestrator::Orchestrator;
use crate::queue::ClaimedJob;
use crate::session::SessionRegistry;

/// Calls the worker agent makes against the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register this agent. Fatal on failure — the agent never runs
    /// unregistered.
    async fn register(&self, name: &str) -> Result<Worker, AgentError>;

    /// Report liveness and current status.
    async fn heartbeat(&self, worker_id: Uuid, status: WorkerStatus) -> Result<(), AgentError>;

    /// Claim the next job over the given lanes.
    async fn claim_work(
        &self,
        lanes: &[String],
        worker_id: Uuid,
    ) -> Result<Option<ClaimedJob>, AgentError>;

    /// Report a task status transition.
    async fn update_task_status(&self, task_id: Uuid, status: TaskStatus)
    -> Result<(), AgentError>;

    /// Create (or refresh) the session mapping for this agent.
    async fn create_session(
        &self,
        external_id: &str,
        worker_id: Uuid,
        task_id: Option<Uuid>,
    ) -> Result<(), AgentError>;

    /// Refresh session activity.
    async fn session_heartbeat(&self, external_id: &str) -> Result<(), AgentError>;

    /// Send a clarification message to the human reviewer.
    async fn send_worker_message(
        &self,
        external_id: &str,
        worker_id: Uuid,
        content: &str,
        task_id: Option<Uuid>,
    ) -> Result<(), AgentError>;

    /// Remove this agent's registration.
    async fn deregister(&self, worker_id: Uuid) -> Result<(), AgentError>;
}

// ── HTTP implementation ─────────────────────────────────────────────

/// reqwest-backed control plane client.
pub struct HttpControlPlane {
    base_url: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }
}

/// Map a response to an error when the server did not accept the call.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(AgentError::ControlPlane(format!("{status}: {body}")))
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, name: &str) -> Result<Worker, AgentError> {
        let resp = self
            .client
            .post(self.url("/workers"))
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn heartbeat(&self, worker_id: Uuid, status: WorkerStatus) -> Result<(), AgentError> {
        let resp = self
            .client
            .post(self.url(&format!("/workers/{worker_id}/heartbeat")))
            .json(&json!({ "status": status }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    async fn claim_work(
        &self,
        lanes: &[String],
        worker_id: Uuid,
    ) -> Result<Option<ClaimedJob>, AgentError> {
        let resp = self
            .client
            .post(self.url("/queue/claim"))
            .json(&json!({ "lanes": lanes, "worker_id": worker_id }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), AgentError> {
        let resp = self
            .client
            .patch(self.url(&format!("/tasks/{task_id}")))
            .json(&json!({ "status": status }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    async fn create_session(
        &self,
        external_id: &str,
        worker_id: Uuid,
        task_id: Option<Uuid>,
    ) -> Result<(), AgentError> {
        let resp = self
            .client
            .post(self.url("/sessions"))
            .json(&json!({
                "external_id": external_id,
                "worker_id": worker_id,
                "task_id": task_id,
            }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    async fn session_heartbeat(&self, external_id: &str) -> Result<(), AgentError> {
        let resp = self
            .client
            .post(self.url(&format!("/sessions/{external_id}/heartbeat")))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    async fn send_worker_message(
        &self,
        external_id: &str,
        worker_id: Uuid,
        content: &str,
        task_id: Option<Uuid>,
    ) -> Result<(), AgentError> {
        let resp = self
            .client
            .post(self.url("/chat/worker-message"))
            .json(&json!({
                "external_session_id": external_id,
                "worker_id": worker_id,
                "message": content,
                "task_id": task_id,
            }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    async fn deregister(&self, worker_id: Uuid) -> Result<(), AgentError> {
        let resp = self
            .client
            .delete(self.url(&format!("/workers/{worker_id}")))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }
}

// ── In-process implementation ───────────────────────────────────────

/// Control plane wired directly to the services, bypassing HTTP.
pub struct LocalControlPlane {
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    sessions: Arc<SessionRegistry>,
}

impl LocalControlPlane {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        orchestrator: Arc<Orchestrator>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            dispatcher,
            orchestrator,
            sessions,
        }
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn register(&self, name: &str) -> Result<Worker, AgentError> {
        self.dispatcher
            .register_worker(name)
            .await
            .map_err(|e| AgentError::RegistrationFailed(e.to_string()))
    }

    async fn heartbeat(&self, worker_id: Uuid, status: WorkerStatus) -> Result<(), AgentError> {
        self.dispatcher
            .worker_heartbeat(worker_id, status)
            .await
            .map(|_| ())
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn claim_work(
        &self,
        lanes: &[String],
        worker_id: Uuid,
    ) -> Result<Option<ClaimedJob>, AgentError> {
        Ok(self.dispatcher.claim_work(lanes, Some(worker_id)).await)
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
    ) -> Result<(), AgentError> {
        self.dispatcher
            .update_task_status(task_id, status)
            .await
            .map(|_| ())
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn create_session(
        &self,
        external_id: &str,
        worker_id: Uuid,
        task_id: Option<Uuid>,
    ) -> Result<(), AgentError> {
        self.sessions
            .get_or_create(external_id, worker_id, task_id)
            .await
            .map(|_| ())
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn session_heartbeat(&self, external_id: &str) -> Result<(), AgentError> {
        self.sessions
            .heartbeat(external_id)
            .await
            .map(|_| ())
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn send_worker_message(
        &self,
        external_id: &str,
        worker_id: Uuid,
        content: &str,
        task_id: Option<Uuid>,
    ) -> Result<(), AgentError> {
        self.orchestrator
            .send_worker_message(external_id, worker_id, content, task_id)
            .await
            .map(|_| ())
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }

    async fn deregister(&self, worker_id: Uuid) -> Result<(), AgentError> {
        self.dispatcher
            .deregister_worker(worker_id)
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))
    }
}
