//! Message router — relays clarification traffic between workers and the
//! human reviewer.
//!
//! Worker messages are persisted, stamped onto the owning session, and
//! announced on the `worker_requests` lane; human replies are threaded via
//! `in_reply_to` and announced on `controller_responses`. Store writes
//! commit before the corresponding queue push, so a fault between the two
//! strands the notification but never the message.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{ChatMessage, MessageDirection};
use crate::queue::{ControllerResponseNotice, QueueManager, WorkerRequestNotice};
use crate::session::SessionRegistry;
use crate::store::Database;

/// Routing result for a worker message.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMessageReceipt {
    pub message_id: Uuid,
    pub external_session_id: String,
    pub routed_to: &'static str,
    pub status: &'static str,
}

/// Routing result for a human response.
#[derive(Debug, Clone, Serialize)]
pub struct HumanResponseReceipt {
    pub message_id: Uuid,
    pub original_message_id: Uuid,
    pub status: &'static str,
}

/// A worker message still awaiting a human reply, enriched with its
/// session's external id and task association.
#[derive(Debug, Clone, Serialize)]
pub struct PendingMessage {
    pub message_id: Uuid,
    pub external_session_id: Option<String>,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Routes messages between workers and humans on top of the session
/// registry and the queue manager.
pub struct Orchestrator {
    db: Arc<dyn Database>,
    queue: Arc<QueueManager>,
    sessions: Arc<SessionRegistry>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<QueueManager>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            db,
            queue,
            sessions,
        }
    }

    /// Handle an incoming message from a worker: resolve or create the
    /// owning session, persist the message, and announce it for human
    /// review.
    pub async fn send_worker_message(
        &self,
        external_session_id: &str,
        worker_id: Uuid,
        content: &str,
        task_id: Option<Uuid>,
    ) -> Result<WorkerMessageReceipt, OrchestratorError> {
        let session = self
            .sessions
            .get_or_create(external_session_id, worker_id, task_id)
            .await?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            session_id: session.id,
            direction: MessageDirection::WorkerToHuman,
            content: content.to_string(),
            sender_worker_id: Some(worker_id),
            in_reply_to: None,
            created_at: Utc::now(),
        };
        self.db.insert_chat_message(&message).await?;

        let notice = WorkerRequestNotice {
            request_id: message.id,
            external_session_id: external_session_id.to_string(),
            worker_id,
            work_order_id: None,
            task_id: session.task_id,
            message: content.to_string(),
            timestamp: message.created_at,
        };
        // The message is committed; a failed push only strands the
        // notification (at-least-once, may-be-missing).
        if let Err(e) = self.queue.enqueue_worker_request(&notice).await {
            warn!(message_id = %message.id, error = %e, "Worker request notification not enqueued");
        }

        info!(
            message_id = %message.id,
            session = external_session_id,
            worker_id = %worker_id,
            "Worker message routed to human"
        );

        Ok(WorkerMessageReceipt {
            message_id: message.id,
            external_session_id: external_session_id.to_string(),
            routed_to: "human",
            status: "queued_for_human_review",
        })
    }

    /// Handle a human reply to a worker message. Fails with not-found and
    /// performs no writes if the referenced message is unknown.
    pub async fn send_human_response(
        &self,
        original_message_id: Uuid,
        content: &str,
    ) -> Result<HumanResponseReceipt, OrchestratorError> {
        let original = self
            .db
            .get_chat_message(original_message_id)
            .await?
            .ok_or(OrchestratorError::MessageNotFound(original_message_id))?;

        let reply = ChatMessage {
            id: Uuid::new_v4(),
            session_id: original.session_id,
            direction: MessageDirection::HumanToWorker,
            content: content.to_string(),
            sender_worker_id: None,
            in_reply_to: Some(original_message_id),
            created_at: Utc::now(),
        };
        self.db.insert_chat_message(&reply).await?;

        let session = self.db.get_session(original.session_id).await?;
        let external_session_id = match &session {
            Some(session) => {
                self.db.touch_session(&session.external_id, None).await?;
                Some(session.external_id.clone())
            }
            None => None,
        };

        let notice = ControllerResponseNotice {
            response_id: reply.id,
            request_id: original_message_id,
            external_session_id,
            message: content.to_string(),
            generated_by: "human".to_string(),
            timestamp: reply.created_at,
        };
        if let Err(e) = self.queue.enqueue_controller_response(&notice).await {
            warn!(message_id = %reply.id, error = %e, "Controller response notification not enqueued");
        }

        info!(
            message_id = %reply.id,
            original = %original_message_id,
            "Human response routed to worker"
        );

        Ok(HumanResponseReceipt {
            message_id: reply.id,
            original_message_id,
            status: "queued_for_worker",
        })
    }

    /// Worker messages awaiting a human reply, newest first.
    pub async fn pending_messages(
        &self,
        limit: u32,
    ) -> Result<Vec<PendingMessage>, OrchestratorError> {
        let messages = self.db.unreplied_worker_messages(limit).await?;

        let mut pending = Vec::with_capacity(messages.len());
        for message in messages {
            let session = self.db.get_session(message.session_id).await?;
            pending.push(PendingMessage {
                message_id: message.id,
                external_session_id: session.as_ref().map(|s| s.external_id.clone()),
                task_id: session.as_ref().and_then(|s| s.task_id),
                worker_id: message.sender_worker_id,
                content: message.content,
                created_at: message.created_at,
            });
        }
        Ok(pending)
    }

    /// Full conversation for a session, oldest first. An unknown session
    /// yields an empty list, not an error.
    pub async fn conversation(
        &self,
        external_session_id: &str,
    ) -> Result<Vec<ChatMessage>, OrchestratorError> {
        let Some(session) = self
            .db
            .get_session_by_external_id(external_session_id)
            .await?
        else {
            return Ok(Vec::new());
        };
        Ok(self.db.session_messages(session.id).await?)
    }
}
