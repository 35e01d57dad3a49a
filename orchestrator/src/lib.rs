pub mod client;
pub mod constants;
pub mod events;
pub mod executor;
pub mod gc;
pub mod handler;
pub mod host;
pub mod job;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use client::Producer;
pub use events::{Event, EventBus, EventListener};
pub use handler::{HandlerRegistry, JobContext, JobHandler, PerformError};
pub use job::{Job, JobPayload, JobStatus};
pub use store::Store;
pub use worker::{Worker, WorkerCommand};
