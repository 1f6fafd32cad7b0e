//! Worker agent — control-plane client, pluggable runner, and the poll loop.

pub mod client;
pub mod runner;
pub mod worker;

pub use client::{ControlPlane, HttpControlPlane, LocalControlPlane};
pub use runner::{SimulationRunner, TaskContext, TaskRunner};
pub use worker::WorkerAgent;
