//! Producer side: validate, admit, and enqueue jobs. Invalid input fails
//! here and never touches a queue; uniqueness rejections and listener
//! vetoes report as `Ok(None)`.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;

use crate::events::{Event, EventBus};
use crate::handler::HandlerRegistry;
use crate::job::{Job, JobStatus, UniqueAdmission};
use crate::store::Store;

#[derive(Clone)]
pub struct Producer {
    store: Store,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
}

impl Producer {
    pub fn new(store: Store, registry: Arc<HandlerRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    /// Enqueue a job. `run_at == 0` queues immediately, anything else lands
    /// in the delayed set for that epoch. Returns the stored job, or `None`
    /// when uniqueness admission or an event listener rejected it.
    pub async fn enqueue(
        &mut self,
        queue: &str,
        class: &str,
        data: Value,
        run_at: i64,
    ) -> Result<Option<Job>> {
        let job = Job::build(queue, class, data, run_at)?;
        let handler = self
            .registry
            .get(class)
            .ok_or_else(|| anyhow::anyhow!("unknown job class '{class}'"))?;

        let span = tracing::info_span!(
            "forq.enqueue",
            job_id = %job.id,
            queue = %job.queue,
            class = %job.class,
            run_at
        );
        let _enter = span.enter();

        self.events.emit(&Event::JobInstance {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            class: job.class.clone(),
        });
        handler.on_queue(&job.data);

        let signature = handler.signature(&job.data);
        if let Some(signature) = signature.as_deref() {
            let admission = job.admit_unique(&mut self.store, signature, false).await?;
            if admission == UniqueAdmission::Rejected {
                tracing::debug!("enqueue rejected by uniqueness admission");
                return Ok(None);
            }
        }

        if run_at > 0 {
            self.enqueue_delayed(job, run_at, &signature).await
        } else {
            self.enqueue_waiting(job, &signature).await
        }
    }

    async fn enqueue_waiting(
        &mut self,
        mut job: Job,
        signature: &Option<String>,
    ) -> Result<Option<Job>> {
        let allowed = self.events.emit(&Event::JobQueue {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
        });
        if !allowed {
            self.release_admission(signature).await;
            tracing::debug!("enqueue vetoed by listener");
            return Ok(None);
        }

        job.status = JobStatus::Waiting;
        self.store.register_queue(&job.queue).await?;
        self.store.save_job(&job).await?;
        self.store.push_waiting(&job.queue, &job.payload).await?;
        self.store.incr_stat(Some(&job.queue), "queued", 1).await?;
        self.store.incr_stat(Some(&job.queue), "total", 1).await?;
        self.index_subjects(&job).await?;

        self.events.emit(&Event::JobQueued {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
        });
        tracing::info!("job queued");
        Ok(Some(job))
    }

    async fn enqueue_delayed(
        &mut self,
        mut job: Job,
        run_at: i64,
        signature: &Option<String>,
    ) -> Result<Option<Job>> {
        let delay_allowed = self.events.emit(&Event::JobDelay {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            run_at,
        });
        let queue_allowed = self.events.emit(&Event::JobQueueDelayed {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            run_at,
        });
        if !delay_allowed || !queue_allowed {
            self.release_admission(signature).await;
            tracing::debug!("delayed enqueue vetoed by listener");
            return Ok(None);
        }

        job.status = JobStatus::Delayed;
        job.delayed = Some(run_at);
        self.store.register_queue(&job.queue).await?;
        self.store.save_job(&job).await?;
        self.store
            .add_delayed(&job.queue, &job.payload, run_at)
            .await?;
        self.store.incr_stat(Some(&job.queue), "delayed", 1).await?;
        self.store.incr_stat(Some(&job.queue), "total", 1).await?;
        self.index_subjects(&job).await?;

        self.events.emit(&Event::JobDelayed {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            run_at,
        });
        self.events.emit(&Event::JobQueuedDelayed {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            run_at,
        });
        tracing::info!(run_at, "job delayed");
        Ok(Some(job))
    }

    async fn index_subjects(&mut self, job: &Job) -> Result<()> {
        let now = Utc::now().timestamp();
        for subject in job.subjects() {
            self.store
                .add_subject_pending(&subject, &job.id, now)
                .await?;
        }
        for series_id in &job.series_id {
            self.store.add_series(series_id, &job.id, now).await?;
        }
        Ok(())
    }

    async fn release_admission(&mut self, signature: &Option<String>) {
        if let Some(signature) = signature {
            if let Err(err) = self.store.release_unique(signature).await {
                tracing::warn!(%signature, error = %err, "failed to release unique lock");
            }
        }
    }

    /// Ask a running job to cancel itself out-of-band. The executing side
    /// observes the override at its next heartbeat or perform start.
    pub async fn request_cancel(&mut self, job_id: &str, reason: &str) -> Result<bool> {
        if self.store.load_job(job_id).await?.is_none() {
            return Ok(false);
        }
        self.store
            .update_job_fields(
                job_id,
                &[
                    (
                        "override_status",
                        JobStatus::Cancelled.as_i64().to_string(),
                    ),
                    ("override_reason", reason.to_string()),
                ],
            )
            .await?;
        tracing::info!(%job_id, %reason, "cancel requested");
        Ok(true)
    }
}
