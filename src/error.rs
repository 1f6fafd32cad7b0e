//! Error types for Foreman.

use uuid::Uuid;

/// Top-level error type for the control plane and worker agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Queue broker and queue manager errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Unknown lane: {0}")]
    UnknownLane(String),

    #[error("Broker unavailable: {0}")]
    Broker(String),

    #[error("Job {id} not found in lane {lane}")]
    JobNotFound { id: String, lane: String },

    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Message routing and session errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Message {0} not found")]
    MessageNotFound(Uuid),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Task intake and work-order bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Work order {0} not found")]
    WorkOrderNotFound(Uuid),

    #[error("Worker {0} not found")]
    WorkerNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Worker agent errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Control plane request failed: {0}")]
    ControlPlane(String),

    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Agent is not registered")]
    NotRegistered,
}
