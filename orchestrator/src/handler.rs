//! Handler capability interface. The runtime never reflects on a handler;
//! it asks through these hooks, all of which default to no-ops.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::executor::OutputSink;

/// How a perform attempt ended, by effect rather than by type name.
#[derive(Debug)]
pub enum PerformError {
    /// Terminal cancellation; never retried.
    Cancel(String),
    /// Re-delay the job. `delay` below the relative/absolute ceiling is
    /// seconds from now, otherwise an absolute epoch. Bypasses the
    /// failed-count threshold.
    Retry { delay: i64, message: String },
    /// Anything unexpected; goes through normal retry evaluation.
    Failure(anyhow::Error),
}

impl fmt::Display for PerformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformError::Cancel(message) => write!(f, "cancelled: {message}"),
            PerformError::Retry { delay, message } => {
                write!(f, "retry in {delay}: {message}")
            }
            PerformError::Failure(error) => write!(f, "{error:#}"),
        }
    }
}

impl From<anyhow::Error> for PerformError {
    fn from(error: anyhow::Error) -> Self {
        PerformError::Failure(error)
    }
}

/// Execution-side view handed to `perform`. Lines written here reach the
/// job's bounded output stream, the aggregate stream, and the optional
/// pub/sub channel.
pub struct JobContext<'a> {
    pub job_id: &'a str,
    pub queue: &'a str,
    /// The `@method` suffix of the job class, when present.
    pub method: Option<&'a str>,
    pub(crate) sink: &'a mut OutputSink,
}

impl JobContext<'_> {
    pub async fn line(&mut self, text: &str) -> anyhow::Result<()> {
        self.sink.line(text).await
    }

    /// Record handler progress, clamped to 0..=100.
    pub async fn set_progress(&mut self, percent: i64) -> anyhow::Result<()> {
        self.sink.set_progress(percent.clamp(0, 100)).await
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, data: &Value, ctx: &mut JobContext<'_>) -> Result<(), PerformError>;

    /// Uniqueness signature for admission control. `None` disables it.
    fn signature(&self, _data: &Value) -> Option<String> {
        None
    }

    async fn set_up(&self, _data: &Value) -> Result<(), PerformError> {
        Ok(())
    }

    async fn tear_down(&self) {}

    /// Pub/sub channel name for live output, without the channel prefix.
    fn channel(&self, _data: &Value) -> Option<String> {
        None
    }

    /// Name used in the runtime-stat leaderboards. Defaults to the class.
    fn presentation(&self, _data: &Value) -> Option<String> {
        None
    }

    /// Producer-side hook, invoked before admission control.
    fn on_queue(&self, _data: &Value) {}
}

/// Split `Name@method` into the registered class name and optional method.
pub fn split_class(class: &str) -> (&str, Option<&str>) {
    match class.split_once('@') {
        Some((name, method)) if !method.is_empty() => (name, Some(method)),
        Some((name, _)) => (name, None),
        None => (class, None),
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Look a handler up by job class, ignoring any `@method` suffix.
    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        let (name, _) = split_class(class);
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.get(class).is_some()
    }
}
