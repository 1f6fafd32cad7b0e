//! Configuration types.

use std::time::Duration;

/// Control-plane server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    pub bind_addr: String,
    /// Path of the relational store database file.
    pub db_path: String,
    /// Path of the queue broker database file.
    pub queue_db_path: String,
    /// Sessions with no activity for this long are marked idle by the sweep.
    pub session_idle_timeout: Duration,
    /// Sessions older than this are terminated by the sweep regardless of activity.
    pub session_max_lifetime: Duration,
    /// Idle sessions are terminated once inactive for idle timeout + this grace.
    pub session_idle_grace: Duration,
    /// How often the server invokes the session sweep.
    pub sweep_interval: Duration,
    /// Maximum number of failure re-enqueues per work order.
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            db_path: "./data/foreman.db".to_string(),
            queue_db_path: "./data/foreman-queue.db".to_string(),
            session_idle_timeout: Duration::from_secs(30 * 60),
            session_max_lifetime: Duration::from_secs(4 * 3600),
            session_idle_grace: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(5 * 60),
            max_retries: 3,
        }
    }
}

impl ServerConfig {
    /// Build a config from `FOREMAN_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_str("FOREMAN_BIND_ADDR", &d.bind_addr),
            db_path: env_str("FOREMAN_DB_PATH", &d.db_path),
            queue_db_path: env_str("FOREMAN_QUEUE_DB_PATH", &d.queue_db_path),
            session_idle_timeout: env_secs("FOREMAN_SESSION_IDLE_SECS", d.session_idle_timeout),
            session_max_lifetime: env_secs("FOREMAN_SESSION_MAX_SECS", d.session_max_lifetime),
            session_idle_grace: env_secs("FOREMAN_SESSION_IDLE_GRACE_SECS", d.session_idle_grace),
            sweep_interval: env_secs("FOREMAN_SWEEP_INTERVAL_SECS", d.sweep_interval),
            max_retries: env_u32("FOREMAN_MAX_RETRIES", d.max_retries),
        }
    }
}

/// Worker agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Worker name reported at registration.
    pub name: String,
    /// Base URL of the control-plane API.
    pub api_url: String,
    /// Lanes polled for work, in priority order.
    pub lanes: Vec<String>,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Back-off after an unhandled loop fault.
    pub error_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "foreman-worker".to_string(),
            api_url: "http://localhost:8000".to_string(),
            lanes: vec![
                "high".to_string(),
                "default".to_string(),
                "low".to_string(),
            ],
            poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
        }
    }
}

impl AgentConfig {
    /// Build a config from `FOREMAN_WORKER_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let lanes = std::env::var("FOREMAN_WORKER_LANES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(d.lanes);
        Self {
            name: env_str("FOREMAN_WORKER_NAME", &d.name),
            api_url: env_str("FOREMAN_API_URL", &d.api_url),
            lanes,
            poll_interval: env_secs("FOREMAN_WORKER_POLL_SECS", d.poll_interval),
            heartbeat_interval: env_secs("FOREMAN_WORKER_HEARTBEAT_SECS", d.heartbeat_interval),
            error_backoff: env_secs("FOREMAN_WORKER_BACKOFF_SECS", d.error_backoff),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lifecycle_policy() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.session_idle_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.session_max_lifetime, Duration::from_secs(14400));
        assert_eq!(cfg.max_retries, 3);

        let agent = AgentConfig::default();
        assert_eq!(agent.lanes, ["high", "default", "low"]);
    }
}
