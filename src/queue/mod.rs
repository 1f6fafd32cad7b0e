//! Priority work queue: durable lane broker + queue manager.

pub mod broker;
pub mod job;
pub mod manager;

pub use broker::JobBroker;
pub use job::{ClaimedJob, JobMeta, JobRetention, JobStatus, Lane, LaneStats};
pub use manager::{
    ControllerResponseNotice, QueueManager, WorkOrderPayload, WorkerRequestNotice,
};
