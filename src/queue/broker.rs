//! Durable job broker — five FIFO lanes on a dedicated libSQL database.
//!
//! The claim path is a single `UPDATE … RETURNING` statement, so a job is
//! handed to exactly one caller even under concurrent claimers. The broker
//! also owns retention: finished and failed jobs are purged once their TTL
//! has elapsed.

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::queue::job::{ClaimedJob, JobMeta, JobRetention, JobStatus, Lane, LaneStats};

/// libSQL-backed lane broker.
///
/// Holds a single connection reused for all operations; writes are
/// serialized by the underlying database, which is what makes the
/// queued→started transition atomic.
pub struct JobBroker {
    #[allow(dead_code)]
    db: libsql::Database,
    conn: Connection,
}

impl JobBroker {
    /// Open (or create) the broker database at the given path.
    pub async fn new_local(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Broker(format!("Failed to create queue directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| QueueError::Broker(format!("Failed to open queue database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Broker(format!("Failed to create connection: {e}")))?;

        let broker = Self { db, conn };
        broker.init_schema().await?;
        info!(path = %path.display(), "Queue broker opened");
        Ok(broker)
    }

    /// Create an in-memory broker (for tests).
    pub async fn new_memory() -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Broker(format!("Failed to create in-memory broker: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Broker(format!("Failed to create connection: {e}")))?;

        let broker = Self { db, conn };
        broker.init_schema().await?;
        Ok(broker)
    }

    async fn init_schema(&self) -> Result<(), QueueError> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    lane TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    meta TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    timeout_secs INTEGER NOT NULL,
                    result_ttl_secs INTEGER NOT NULL,
                    failure_ttl_secs INTEGER NOT NULL,
                    enqueued_at TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_lane_status ON jobs(lane, status);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                "#,
            )
            .await
            .map_err(|e| QueueError::Broker(format!("Failed to initialize queue schema: {e}")))?;
        Ok(())
    }

    /// Enqueue a job at the tail of a lane. Returns the job id.
    pub async fn enqueue(
        &self,
        job_id: &str,
        lane: Lane,
        payload: &serde_json::Value,
        meta: &JobMeta,
        retention: JobRetention,
    ) -> Result<String, QueueError> {
        let meta_json = serde_json::to_string(meta)?;
        let payload_json = serde_json::to_string(payload)?;

        self.conn
            .execute(
                "INSERT INTO jobs (id, lane, payload, meta, status, timeout_secs, result_ttl_secs, failure_ttl_secs, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8)",
                params![
                    job_id,
                    lane.as_str(),
                    payload_json,
                    meta_json,
                    retention.timeout_secs as i64,
                    retention.result_ttl_secs as i64,
                    retention.failure_ttl_secs as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| QueueError::Broker(format!("enqueue: {e}")))?;

        debug!(job_id, lane = %lane, "Job enqueued");
        Ok(job_id.to_string())
    }

    /// One non-blocking atomic dequeue attempt against a single lane.
    ///
    /// The subquery picks the oldest queued job and the enclosing UPDATE
    /// flips it to started in the same statement, so no two callers can
    /// receive the same job.
    pub async fn claim_one(&self, lane: Lane) -> Result<Option<ClaimedJob>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "UPDATE jobs SET status = 'started', started_at = ?2
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE lane = ?1 AND status = 'queued'
                     ORDER BY enqueued_at ASC, rowid ASC
                     LIMIT 1
                 )
                 RETURNING id, payload, meta",
                params![lane.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| QueueError::Broker(format!("claim_one: {e}")))?;

        let row = match rows
            .next()
            .await
            .map_err(|e| QueueError::Broker(format!("claim_one: {e}")))?
        {
            Some(row) => row,
            None => return Ok(None),
        };

        let job_id: String = row
            .get(0)
            .map_err(|e| QueueError::Broker(format!("claim_one: {e}")))?;
        let payload_str: String = row
            .get(1)
            .map_err(|e| QueueError::Broker(format!("claim_one: {e}")))?;
        let meta_str: String = row
            .get(2)
            .map_err(|e| QueueError::Broker(format!("claim_one: {e}")))?;

        let payload = serde_json::from_str(&payload_str)?;
        let meta = serde_json::from_str(&meta_str)?;

        debug!(job_id, lane = %lane, "Job claimed");
        Ok(Some(ClaimedJob {
            job_id,
            lane,
            payload,
            meta,
        }))
    }

    /// Mark a started job finished.
    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        self.mark_terminal(job_id, JobStatus::Finished).await
    }

    /// Mark a started job failed.
    pub async fn fail(&self, job_id: &str) -> Result<(), QueueError> {
        self.mark_terminal(job_id, JobStatus::Failed).await
    }

    async fn mark_terminal(&self, job_id: &str, status: JobStatus) -> Result<(), QueueError> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?2, finished_at = ?3 WHERE id = ?1 AND status = 'started'",
                params![job_id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| QueueError::Broker(format!("mark_terminal: {e}")))?;

        if changed == 0 {
            debug!(job_id, status = %status, "No started job to mark terminal");
        }
        Ok(())
    }

    /// Per-lane job counts. Read-only and eventually consistent with
    /// in-flight claims.
    pub async fn lane_stats(&self) -> Result<Vec<(Lane, LaneStats)>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT lane, status, COUNT(*) FROM jobs GROUP BY lane, status",
                (),
            )
            .await
            .map_err(|e| QueueError::Broker(format!("lane_stats: {e}")))?;

        let mut stats: Vec<(Lane, LaneStats)> =
            Lane::ALL.iter().map(|l| (*l, LaneStats::default())).collect();

        while let Ok(Some(row)) = rows.next().await {
            let lane_str: String = row.get(0).unwrap_or_default();
            let status_str: String = row.get(1).unwrap_or_default();
            let count: i64 = row.get(2).unwrap_or(0);

            let Some(lane) = Lane::parse(&lane_str) else {
                continue;
            };
            let Some((_, entry)) = stats.iter_mut().find(|(l, _)| *l == lane) else {
                continue;
            };

            match status_str.as_str() {
                "queued" => entry.pending = count as u64,
                "started" => entry.started = count as u64,
                "finished" => entry.finished = count as u64,
                "failed" => entry.failed = count as u64,
                "deferred" => entry.deferred = count as u64,
                "scheduled" => entry.scheduled = count as u64,
                _ => {}
            }
        }

        Ok(stats)
    }

    /// Drop finished jobs older than their result TTL and failed jobs older
    /// than their failure TTL. Returns the number of jobs removed.
    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut rows = self
            .conn
            .query(
                "SELECT id, status, finished_at, result_ttl_secs, failure_ttl_secs
                 FROM jobs
                 WHERE status IN ('finished', 'failed') AND finished_at IS NOT NULL",
                (),
            )
            .await
            .map_err(|e| QueueError::Broker(format!("purge_expired: {e}")))?;

        let mut expired: Vec<String> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).unwrap_or_default();
            let status: String = row.get(1).unwrap_or_default();
            let finished_str: String = row.get(2).unwrap_or_default();
            let result_ttl: i64 = row.get(3).unwrap_or(0);
            let failure_ttl: i64 = row.get(4).unwrap_or(0);

            let Ok(finished_at) = DateTime::parse_from_rfc3339(&finished_str) else {
                continue;
            };
            let ttl = if status == "failed" { failure_ttl } else { result_ttl };
            let age = now.signed_duration_since(finished_at.with_timezone(&Utc));
            if age.num_seconds() >= ttl {
                expired.push(id);
            }
        }

        let mut removed = 0;
        for id in expired {
            removed += self
                .conn
                .execute("DELETE FROM jobs WHERE id = ?1", params![id])
                .await
                .map_err(|e| QueueError::Broker(format!("purge_expired: {e}")))?;
        }

        if removed > 0 {
            debug!(removed, "Purged expired jobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_broker() -> JobBroker {
        JobBroker::new_memory().await.unwrap()
    }

    fn retention() -> JobRetention {
        JobRetention {
            timeout_secs: 3600,
            result_ttl_secs: 86400,
            failure_ttl_secs: 604800,
        }
    }

    fn meta() -> JobMeta {
        JobMeta {
            work_order_id: None,
            task_id: None,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_and_claim_fifo() {
        let broker = test_broker().await;

        broker
            .enqueue("job-1", Lane::Default, &serde_json::json!({"n": 1}), &meta(), retention())
            .await
            .unwrap();
        broker
            .enqueue("job-2", Lane::Default, &serde_json::json!({"n": 2}), &meta(), retention())
            .await
            .unwrap();

        let first = broker.claim_one(Lane::Default).await.unwrap().unwrap();
        assert_eq!(first.job_id, "job-1");
        assert_eq!(first.payload["n"], 1);

        let second = broker.claim_one(Lane::Default).await.unwrap().unwrap();
        assert_eq!(second.job_id, "job-2");

        assert!(broker.claim_one(Lane::Default).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_empty_lane_returns_none() {
        let broker = test_broker().await;
        assert!(broker.claim_one(Lane::High).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lanes_are_independent() {
        let broker = test_broker().await;
        broker
            .enqueue("job-h", Lane::High, &serde_json::json!({}), &meta(), retention())
            .await
            .unwrap();

        assert!(broker.claim_one(Lane::Default).await.unwrap().is_none());
        assert!(broker.claim_one(Lane::High).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_never_duplicate() {
        let broker = Arc::new(test_broker().await);

        for i in 0..10 {
            broker
                .enqueue(
                    &format!("job-{i}"),
                    Lane::Default,
                    &serde_json::json!({"n": i}),
                    &meta(),
                    retention(),
                )
                .await
                .unwrap();
        }

        let claims = futures::future::join_all((0..20).map(|_| {
            let broker = Arc::clone(&broker);
            async move { broker.claim_one(Lane::Default).await.unwrap() }
        }))
        .await;

        let mut ids: Vec<String> = claims.into_iter().flatten().map(|c| c.job_id).collect();
        assert_eq!(ids.len(), 10);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10, "a job was handed to more than one claimer");
    }

    #[tokio::test]
    async fn stats_track_job_lifecycle() {
        let broker = test_broker().await;
        broker
            .enqueue("job-1", Lane::Low, &serde_json::json!({}), &meta(), retention())
            .await
            .unwrap();
        broker
            .enqueue("job-2", Lane::Low, &serde_json::json!({}), &meta(), retention())
            .await
            .unwrap();

        let claimed = broker.claim_one(Lane::Low).await.unwrap().unwrap();
        broker.complete(&claimed.job_id).await.unwrap();

        let stats = broker.lane_stats().await.unwrap();
        let (_, low) = stats.iter().find(|(l, _)| *l == Lane::Low).unwrap();
        assert_eq!(low.pending, 1);
        assert_eq!(low.started, 0);
        assert_eq!(low.finished, 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let broker = test_broker().await;
        broker
            .enqueue(
                "job-old",
                Lane::Default,
                &serde_json::json!({}),
                &meta(),
                JobRetention {
                    timeout_secs: 60,
                    result_ttl_secs: 0,
                    failure_ttl_secs: 0,
                },
            )
            .await
            .unwrap();
        broker
            .enqueue("job-new", Lane::Default, &serde_json::json!({}), &meta(), retention())
            .await
            .unwrap();

        let old = broker.claim_one(Lane::Default).await.unwrap().unwrap();
        broker.complete(&old.job_id).await.unwrap();
        let new = broker.claim_one(Lane::Default).await.unwrap().unwrap();
        broker.complete(&new.job_id).await.unwrap();

        let removed = broker.purge_expired().await.unwrap();
        assert_eq!(removed, 1);

        let stats = broker.lane_stats().await.unwrap();
        let (_, lane) = stats.iter().find(|(l, _)| *l == Lane::Default).unwrap();
        assert_eq!(lane.finished, 1);
    }
}
