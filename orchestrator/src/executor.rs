//! Child-side job execution. The worker spawns this binary again for each
//! claimed job; everything here runs in that child with its own Redis
//! connection. No handler error escapes: every path records a terminal
//! state, except a wall-clock timeout, which exits non-zero and leaves the
//! reconciliation to the parent.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

use crate::constants::OUTPUT_STREAM_TTL_SECONDS;
use crate::events::{Event, EventBus};
use crate::handler::{HandlerRegistry, JobContext, JobHandler, PerformError, split_class};
use crate::job::{Job, JobStatus, UniqueAdmission};
use crate::store::Store;
use forq_config::ForqSettings;

/// How an execution attempt ended, from the child's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Cancelled,
    Retried,
    FailedAttempt,
    /// Wall-clock limit hit; no terminal state was recorded.
    TimedOut,
}

/// Forwards handler output to the per-job stream, the aggregate stream, and
/// the optional pub/sub channel, while accumulating the full transcript for
/// the job hash.
pub struct OutputSink {
    store: Store,
    job_id: String,
    channel: Option<String>,
    buffer: Arc<Mutex<String>>,
    latest: Arc<Mutex<String>>,
    stream_touched: bool,
}

impl OutputSink {
    pub fn new(store: Store, job_id: &str, channel: Option<String>) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
            channel,
            buffer: Arc::new(Mutex::new(String::new())),
            latest: Arc::new(Mutex::new(String::new())),
            stream_touched: false,
        }
    }

    fn transcript_handles(&self) -> (Arc<Mutex<String>>, Arc<Mutex<String>>) {
        (self.buffer.clone(), self.latest.clone())
    }

    pub(crate) async fn line(&mut self, text: &str) -> Result<()> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push_str(text);
            buffer.push('\n');
        }
        if let Ok(mut latest) = self.latest.lock() {
            text.clone_into(&mut latest);
        }

        self.store.xadd_job_output(&self.job_id, text).await?;
        if !self.stream_touched {
            self.store
                .expire_job_output(&self.job_id, OUTPUT_STREAM_TTL_SECONDS)
                .await?;
            self.stream_touched = true;
        }
        self.store.xadd_aggregate_output(&self.job_id, text).await?;
        if let Some(channel) = self.channel.clone() {
            let channel_key = self.store.keys().job_channel(&channel);
            self.store.publish(&channel_key, text).await?;
        }
        self.store
            .update_job_fields(&self.job_id, &[("latest_line", text.to_string())])
            .await?;
        Ok(())
    }

    pub(crate) async fn set_progress(&mut self, percent: i64) -> Result<()> {
        self.store
            .update_job_fields(
                &self.job_id,
                &[
                    ("progress", percent.to_string()),
                    ("updated", Utc::now().timestamp().to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

async fn run_handler(
    handler: Arc<dyn JobHandler>,
    data: serde_json::Value,
    method: Option<String>,
    mut sink: OutputSink,
    job_id: String,
    queue: String,
) -> Result<(), PerformError> {
    let mut ctx = JobContext {
        job_id: &job_id,
        queue: &queue,
        method: method.as_deref(),
        sink: &mut sink,
    };
    let result = match handler.set_up(&data).await {
        Ok(()) => handler.perform(&data, &mut ctx).await,
        Err(err) => Err(err),
    };
    handler.tear_down().await;
    result
}

/// Execute one claimed job to a terminal state. `cancel` is signalled by
/// SIGUSR1 in the child; tests trigger it directly. When `on_worker` is set
/// the runtime-stat leaderboards are maintained as well.
pub async fn perform_job(
    store: &mut Store,
    events: &EventBus,
    registry: &HandlerRegistry,
    job: &mut Job,
    cancel: Arc<Notify>,
    on_worker: bool,
) -> Result<ExecutionOutcome> {
    let started_at = std::time::Instant::now();
    let span = tracing::info_span!(
        "forq.perform",
        job_id = %job.id,
        queue = %job.queue,
        class = %job.class,
        worker = %job.worker,
        attempt = job.failed_count + 1
    );
    let _enter = span.enter();

    let allowed = events.emit(&Event::JobPerform {
        job_id: job.id.clone(),
        class: job.class.clone(),
    });
    if !allowed {
        job.cancel(store, events, "vetoed by listener").await?;
        return Ok(ExecutionOutcome::Cancelled);
    }

    // Remote override, re-read from the hash: the producer may have written
    // it after the claim.
    let override_status = store
        .job_field(&job.id, "override_status")
        .await?
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(JobStatus::parse);
    if override_status == Some(JobStatus::Cancelled) {
        let reason = store
            .job_field(&job.id, "override_reason")
            .await?
            .unwrap_or_else(|| "cancelled by override".to_string());
        job.cancel(store, events, &reason).await?;
        return Ok(ExecutionOutcome::Cancelled);
    }

    let Some(handler) = registry.get(&job.class) else {
        let error = format!("unknown job class '{}'", job.class);
        let outcome = fail_attempt(store, events, job, &error, None).await?;
        return Ok(outcome);
    };

    if let Some(signature) = handler.signature(&job.data) {
        let admission = job.admit_unique(store, &signature, true).await?;
        if admission == UniqueAdmission::Rejected {
            job.cancel(store, events, "duplicate: uniqueness lock held")
                .await?;
            return Ok(ExecutionOutcome::Cancelled);
        }
    }

    events.emit(&Event::JobPerforming {
        job_id: job.id.clone(),
        class: job.class.clone(),
    });

    let sink = OutputSink::new(
        store.clone(),
        &job.id,
        handler.channel(&job.data),
    );
    let (buffer, latest) = sink.transcript_handles();
    let (_, method) = split_class(&job.class);
    let mut task = tokio::spawn(run_handler(
        handler.clone(),
        job.data.clone(),
        method.map(str::to_string),
        sink,
        job.id.clone(),
        job.queue.clone(),
    ));

    let wall_limit = Duration::from_secs(store.settings().timeout.max(1) as u64);
    let outcome = tokio::select! {
        joined = timeout(wall_limit, &mut task) => match joined {
            Err(_) => {
                task.abort();
                persist_transcript(store, job, &buffer, &latest).await?;
                tracing::warn!(limit_seconds = wall_limit.as_secs(), "job hit wall-clock limit");
                return Ok(ExecutionOutcome::TimedOut);
            }
            Ok(Err(join_error)) => {
                let error = if join_error.is_panic() {
                    format!("panic in handler: {join_error}")
                } else {
                    format!("handler task aborted: {join_error}")
                };
                fail_attempt(store, events, job, &error, None).await?
            }
            Ok(Ok(Ok(()))) => {
                job.complete(store, events).await?;
                ExecutionOutcome::Completed
            }
            Ok(Ok(Err(PerformError::Cancel(message)))) => {
                job.cancel(store, events, &message).await?;
                ExecutionOutcome::Cancelled
            }
            Ok(Ok(Err(PerformError::Retry { delay, message }))) => {
                fail_attempt(store, events, job, &message, Some(delay)).await?
            }
            Ok(Ok(Err(PerformError::Failure(error)))) => {
                fail_attempt(store, events, job, &format!("{error:#}"), None).await?
            }
        },
        _ = cancel.notified() => {
            task.abort();
            job.cancel(store, events, "cancelled by signal").await?;
            ExecutionOutcome::Cancelled
        }
    };

    persist_transcript(store, job, &buffer, &latest).await?;
    if on_worker {
        let duration = started_at.elapsed().as_secs_f64();
        let presentation = handler
            .presentation(&job.data)
            .unwrap_or_else(|| split_class(&job.class).0.to_string());
        if let Err(err) = record_runtime_stats(store, job, &presentation, duration).await {
            tracing::warn!(error = %err, "failed to record runtime stats");
        }
    }
    events.emit(&Event::JobDone {
        job_id: job.id.clone(),
    });
    Ok(outcome)
}

async fn fail_attempt(
    store: &mut Store,
    events: &EventBus,
    job: &mut Job,
    error: &str,
    retry_delay: Option<i64>,
) -> Result<ExecutionOutcome> {
    use crate::job::FailOutcome;
    let outcome = job.fail(store, events, error, retry_delay).await?;
    Ok(match outcome {
        FailOutcome::Terminal => ExecutionOutcome::FailedAttempt,
        FailOutcome::Requeued | FailOutcome::Delayed(_) => ExecutionOutcome::Retried,
    })
}

/// The aggregated transcript reaches the hash on every exit path.
async fn persist_transcript(
    store: &mut Store,
    job: &mut Job,
    buffer: &Arc<Mutex<String>>,
    latest: &Arc<Mutex<String>>,
) -> Result<()> {
    let output = buffer.lock().map(|value| value.clone()).unwrap_or_default();
    let latest_line = latest.lock().map(|value| value.clone()).unwrap_or_default();
    job.output.clone_from(&output);
    job.latest_line.clone_from(&latest_line);
    store
        .update_job_fields(
            &job.id,
            &[("output", output), ("latest_line", latest_line)],
        )
        .await?;
    Ok(())
}

/// Per-presentation runtime accounting: last run timestamp, arithmetic mean
/// of the interval between runs, and the time/count leaderboards keyed by
/// `status::presentation`.
async fn record_runtime_stats(
    store: &mut Store,
    job: &Job,
    presentation: &str,
    duration_seconds: f64,
) -> Result<()> {
    let now = Utc::now().timestamp();
    let stat = store.job_stat_map(presentation).await?;
    let recent = stat.get("recent").and_then(|value| value.parse::<i64>().ok());
    let mut mean = stat
        .get("mean")
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(0.0);
    let mut count = stat
        .get("count")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);

    if let Some(recent) = recent {
        let interval = (now - recent).max(0) as f64;
        mean = (mean * count as f64 + interval) / (count + 1) as f64;
        count += 1;
    }
    store.set_job_stat(presentation, now, mean, count).await?;

    let member = format!("{}::{presentation}", job.status.as_str());
    store.zincr_time(&member, duration_seconds).await?;
    store.zincr_count(&member).await?;
    Ok(())
}

/// Entry point for the hidden child subcommand. Opens a fresh connection,
/// names it after the job, and executes. Exit code 0 means a terminal state
/// was recorded; anything else tells the parent to reconcile.
pub async fn run_child(
    settings: ForqSettings,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    job_id: &str,
    queue: &str,
    worker_id: &str,
) -> Result<i32> {
    let mut store = Store::new(settings).await?;
    if let Err(err) = store.set_client_name(&format!("job:{job_id}")).await {
        tracing::debug!(error = %err, "failed to set client name");
    }

    let Some(mut job) = store.load_job(job_id).await? else {
        anyhow::bail!("job {job_id} not found");
    };
    job.queue = queue.to_string();
    job.worker = worker_id.to_string();

    let cancel = Arc::new(Notify::new());
    spawn_cancel_listener(cancel.clone());

    events.emit(&Event::WorkerForkChild {
        worker_id: worker_id.to_string(),
        job_id: job_id.to_string(),
    });

    let outcome = perform_job(&mut store, &events, &registry, &mut job, cancel, true).await?;
    Ok(match outcome {
        ExecutionOutcome::TimedOut => 2,
        _ => 0,
    })
}

#[cfg(unix)]
fn spawn_cancel_listener(cancel: Arc<Notify>) {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::user_defined1()) {
        Ok(mut usr1) => {
            tokio::spawn(async move {
                while usr1.recv().await.is_some() {
                    cancel.notify_waiters();
                }
            });
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGUSR1 handler");
        }
    }
}

#[cfg(not(unix))]
fn spawn_cancel_listener(_cancel: Arc<Notify>) {}
