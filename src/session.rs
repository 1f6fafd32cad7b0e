//! Session registry — external-id keyed execution contexts and their
//! idle/terminate lifecycle.
//!
//! The sweep is externally triggered (the server runs a ticker) and uses
//! guarded single-row updates so it can run concurrently with ordinary
//! session activity without losing either effect.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{Session, SessionStatus};
use crate::store::Database;

/// Lifecycle thresholds for the sweep.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    /// No activity for this long: active → idle.
    pub idle_timeout: Duration,
    /// Older than this: active → terminated, regardless of activity.
    pub max_lifetime: Duration,
    /// Idle and inactive for idle_timeout + this grace: idle → terminated.
    pub idle_grace: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            max_lifetime: Duration::from_secs(4 * 3600),
            idle_grace: Duration::from_secs(3600),
        }
    }
}

/// Result of one sweep invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub marked_idle: u64,
    pub terminated: u64,
    pub checked_at: DateTime<Utc>,
}

/// Maps external session identifiers to worker/task associations and
/// drives the idle/terminate state machine.
pub struct SessionRegistry {
    db: Arc<dyn Database>,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(db: Arc<dyn Database>, policy: SessionPolicy) -> Self {
        Self { db, policy }
    }

    /// Resolve a session by external id, creating it (active) on first
    /// sight. Existing sessions are touched: status active, activity
    /// refreshed, task attached first-write-wins.
    pub async fn get_or_create(
        &self,
        external_id: &str,
        worker_id: Uuid,
        task_id: Option<Uuid>,
    ) -> Result<Session, OrchestratorError> {
        if let Some(session) = self.db.touch_session(external_id, task_id).await? {
            return Ok(session);
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            worker_id,
            task_id,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            terminated_at: None,
        };

        match self.db.insert_session(&session).await {
            Ok(()) => {
                debug!(external_id, worker_id = %worker_id, "Session created");
                Ok(session)
            }
            // Lost a create race: another writer inserted the same external
            // id between our touch and insert. Touch the winner instead.
            Err(crate::error::DatabaseError::Constraint(_)) => self
                .db
                .touch_session(external_id, task_id)
                .await?
                .ok_or_else(|| OrchestratorError::SessionNotFound(external_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Record activity on an existing session.
    pub async fn touch(
        &self,
        external_id: &str,
        task_id: Option<Uuid>,
    ) -> Result<Session, OrchestratorError> {
        self.db
            .touch_session(external_id, task_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(external_id.to_string()))
    }

    /// Heartbeat: activity with no task attachment.
    pub async fn heartbeat(&self, external_id: &str) -> Result<Session, OrchestratorError> {
        self.touch(external_id, None).await
    }

    /// Look up a session by external id.
    pub async fn get(&self, external_id: &str) -> Result<Option<Session>, OrchestratorError> {
        Ok(self.db.get_session_by_external_id(external_id).await?)
    }

    /// List sessions, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.db.list_sessions(status).await?)
    }

    /// Explicit termination from any state.
    pub async fn terminate(&self, external_id: &str) -> Result<Session, OrchestratorError> {
        let session = self
            .db
            .terminate_session(external_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(external_id.to_string()))?;
        info!(external_id, "Session terminated");
        Ok(session)
    }

    /// One sweep pass over all sessions.
    ///
    /// Active sessions past the max lifetime terminate; otherwise ones
    /// inactive past the idle timeout go idle. Idle sessions inactive past
    /// idle timeout + grace terminate. Full scan, no pagination.
    pub async fn sweep(&self) -> Result<SweepReport, OrchestratorError> {
        let now = Utc::now();
        let to_chrono = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
        let idle_cutoff = now - to_chrono(self.policy.idle_timeout);
        let lifetime_cutoff = now - to_chrono(self.policy.max_lifetime);
        let grace_cutoff = idle_cutoff - to_chrono(self.policy.idle_grace);

        let mut marked_idle = 0;
        let mut terminated = 0;

        for session in self.db.list_sessions(Some(SessionStatus::Active)).await? {
            if session.created_at < lifetime_cutoff {
                if self
                    .db
                    .terminate_session_if_expired(session.id, lifetime_cutoff)
                    .await?
                {
                    terminated += 1;
                }
            } else if session.last_activity_at < idle_cutoff
                && self
                    .db
                    .mark_session_idle_if_stale(session.id, idle_cutoff)
                    .await?
            {
                marked_idle += 1;
            }
        }

        for session in self.db.list_sessions(Some(SessionStatus::Idle)).await? {
            if session.last_activity_at < grace_cutoff
                && self
                    .db
                    .terminate_idle_session_if_stale(session.id, grace_cutoff)
                    .await?
            {
                terminated += 1;
            }
        }

        if marked_idle > 0 || terminated > 0 {
            info!(marked_idle, terminated, "Session sweep applied transitions");
        }

        Ok(SweepReport {
            marked_idle,
            terminated,
            checked_at: now,
        })
    }
}
