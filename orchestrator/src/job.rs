//! The job entity and its state machine. Transitions write through the
//! store; nothing here holds in-process locks, Redis is the only shared
//! state.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    Archive, BACKOFF_CAP_SECONDS, DIRECT_REQUEUE_LIMIT, EXCEPTION_HISTORY_MAX,
    RELATIVE_DELAY_CEILING, UNIQUE_LOCK_TTL_SECONDS, UNLIMITED_RETRIES,
};
use crate::events::{Event, EventBus};
use crate::store::Store;

pub const ID_LENGTH: usize = 22;
const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Delayed,
    Running,
    Complete,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            JobStatus::Waiting => 1,
            JobStatus::Delayed => 2,
            JobStatus::Running => 3,
            JobStatus::Complete => 4,
            JobStatus::Cancelled => 5,
            JobStatus::Failed => 6,
        }
    }

    pub fn parse(value: i64) -> Option<Self> {
        match value {
            1 => Some(JobStatus::Waiting),
            2 => Some(JobStatus::Delayed),
            3 => Some(JobStatus::Running),
            4 => Some(JobStatus::Complete),
            5 => Some(JobStatus::Cancelled),
            6 => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Delayed => "DELAYED",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// The immutable wire descriptor of a job. Field order and the sorted map
/// keys of `data` make the encoding deterministic, so a payload keeps its
/// identity across requeues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: String,
    pub class: String,
    pub data: Value,
}

impl JobPayload {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// 22-character opaque id: queue name and wall-clock nanoseconds mixed into
/// the high word, a hash of (class, data, run_at, random nonce) in the low
/// word, base62-encoded.
pub fn generate_id(queue: &str, class: &str, data: &Value, run_at: i64) -> String {
    let now_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);

    let mut queue_hasher = DefaultHasher::new();
    queue.hash(&mut queue_hasher);

    let mut body_hasher = DefaultHasher::new();
    class.hash(&mut body_hasher);
    data.to_string().hash(&mut body_hasher);
    run_at.hash(&mut body_hasher);
    rand::random::<u64>().hash(&mut body_hasher);

    let hi = (now_nanos as u64) ^ queue_hasher.finish().rotate_left(17);
    let value = ((hi as u128) << 64) | body_hasher.finish() as u128;
    encode_base62(value)
}

fn encode_base62(mut value: u128) -> String {
    let mut out = [b'0'; ID_LENGTH];
    let mut index = ID_LENGTH;
    while value > 0 && index > 0 {
        index -= 1;
        out[index] = BASE62[(value % 62) as usize];
        value /= 62;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Turn a retry delay into an absolute run time. Values below the ceiling
/// are seconds from now, values above are already an epoch. The heuristic
/// is preserved for compatibility; values close to the boundary are flagged.
pub fn resolve_run_at(now: i64, delay: i64) -> i64 {
    const BOUNDARY_MARGIN: i64 = 86_400;
    if delay < RELATIVE_DELAY_CEILING {
        if delay > RELATIVE_DELAY_CEILING - BOUNDARY_MARGIN {
            tracing::warn!(delay, "retry delay is close to the relative/absolute boundary");
        }
        now + delay.max(0)
    } else {
        if delay < RELATIVE_DELAY_CEILING + BOUNDARY_MARGIN {
            tracing::warn!(delay, "retry delay is close to the relative/absolute boundary");
        }
        delay
    }
}

/// Exponential backoff window for the n-th failure: a random delay in
/// [2^n / 2, 2^n] seconds, clamped to the cap.
pub fn backoff_delay_seconds(failed_count: i64) -> i64 {
    let exponent = failed_count.clamp(1, 16) as u32;
    let upper = 1i64 << exponent;
    let lower = (upper / 2).max(1);
    let delay = rand::rng().random_range(lower..=upper);
    delay.min(BACKOFF_CAP_SECONDS)
}

/// Outcome of the failure path, for callers that care which branch ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued,
    Delayed(i64),
    Terminal,
}

/// Outcome of uniqueness admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueAdmission {
    Admitted,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub class: String,
    pub data: Value,
    pub payload: String,
    pub status: JobStatus,
    pub created: i64,
    pub updated: i64,
    pub started: Option<i64>,
    pub finished: Option<i64>,
    pub delayed: Option<i64>,
    pub failed_count: i64,
    pub progress: i64,
    pub latest_line: String,
    pub output: String,
    pub exception: Vec<String>,
    pub worker: String,
    pub override_status: Option<JobStatus>,
    pub override_reason: String,
    pub series_id: Vec<String>,
}

impl Job {
    /// Construct a new job. Invalid input fails here, before any Redis
    /// write: an empty queue or an empty class never enters a queue.
    pub fn build(queue: &str, class: &str, data: Value, run_at: i64) -> Result<Self> {
        if queue.is_empty() {
            anyhow::bail!("queue must not be empty");
        }
        let (base, _method) = crate::handler::split_class(class);
        if base.is_empty() {
            anyhow::bail!("job class must not be empty");
        }

        let id = generate_id(queue, class, &data, run_at);
        let payload = JobPayload {
            id: id.clone(),
            class: class.to_string(),
            data: data.clone(),
        }
        .encode()?;
        let now = Utc::now().timestamp();
        let series_id = string_or_list(&data, "series_id");

        Ok(Self {
            id,
            queue: queue.to_string(),
            class: class.to_string(),
            data,
            payload,
            status: if run_at > 0 {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            },
            created: now,
            updated: now,
            started: None,
            finished: None,
            delayed: if run_at > 0 { Some(run_at) } else { None },
            failed_count: 0,
            progress: 0,
            latest_line: String::new(),
            output: String::new(),
            exception: Vec::new(),
            worker: String::new(),
            override_status: None,
            override_reason: String::new(),
            series_id,
        })
    }

    /// Load a claimed payload, falling back to the wire descriptor when the
    /// job hash has already expired.
    pub async fn from_claimed_payload(store: &mut Store, queue: &str, raw: &str) -> Result<Self> {
        let payload = JobPayload::decode(raw)?;
        if let Some(job) = store.load_job(&payload.id).await? {
            return Ok(job);
        }
        let mut job = Self::build(queue, &payload.class, payload.data, 0)?;
        job.id = payload.id;
        job.payload = raw.to_string();
        Ok(job)
    }

    pub fn subjects(&self) -> Vec<String> {
        string_or_list(&self.data, "subject")
    }

    pub fn retry_threshold(&self, default: i64) -> i64 {
        self.data
            .get("retry_threshold")
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    fn touch(&mut self) {
        self.updated = Utc::now().timestamp();
    }

    /// Stamp the claim: RUNNING status, claiming worker, start time, and the
    /// running-set entry. The payload itself was already moved into the
    /// worker's processing list by the atomic pop.
    pub async fn mark_running(&mut self, store: &mut Store, worker_id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        self.status = JobStatus::Running;
        self.worker = worker_id.to_string();
        self.started = Some(now);
        self.touch();
        store.add_running(&self.queue, &self.payload, now).await?;
        store
            .update_job_fields(
                &self.id,
                &[
                    ("status", JobStatus::Running.as_i64().to_string()),
                    ("worker", worker_id.to_string()),
                    ("started", now.to_string()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        store.incr_stat(Some(&self.queue), "queued", -1).await?;
        store.incr_stat(Some(&self.queue), "running", 1).await?;
        Ok(())
    }

    pub async fn set_progress(&mut self, store: &mut Store, percent: i64) -> Result<()> {
        self.progress = percent.clamp(0, 100);
        self.touch();
        store
            .update_job_fields(
                &self.id,
                &[
                    ("progress", self.progress.to_string()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Append to the bounded exception history and persist it.
    pub async fn record_exception(&mut self, store: &mut Store, error: &str) -> Result<()> {
        self.exception.push(error.to_string());
        if self.exception.len() > EXCEPTION_HISTORY_MAX {
            let excess = self.exception.len() - EXCEPTION_HISTORY_MAX;
            self.exception.drain(..excess);
        }
        self.touch();
        store
            .update_job_fields(
                &self.id,
                &[
                    ("exception", serde_json::to_string(&self.exception)?),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn leave_flight(&mut self, store: &mut Store) -> Result<()> {
        if !self.worker.is_empty() {
            store
                .remove_processing(&self.queue, &self.worker, &self.payload)
                .await?;
        }
        store.remove_running(&self.queue, &self.payload).await?;
        Ok(())
    }

    async fn settle_subjects(&mut self, store: &mut Store, finished: i64) -> Result<()> {
        for subject in self.subjects() {
            store
                .move_subject_done(&subject, &self.id, finished)
                .await?;
        }
        Ok(())
    }

    /// Handler returned normally: COMPLETE, progress pinned to 100.
    pub async fn complete(&mut self, store: &mut Store, events: &EventBus) -> Result<()> {
        let now = Utc::now().timestamp();
        self.status = JobStatus::Complete;
        self.progress = 100;
        self.finished = Some(now);
        self.touch();

        self.leave_flight(store).await?;
        store
            .archive(&self.queue, Archive::Processed, &self.payload, now)
            .await?;
        store
            .update_job_fields(
                &self.id,
                &[
                    ("status", JobStatus::Complete.as_i64().to_string()),
                    ("progress", "100".to_string()),
                    ("finished", now.to_string()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        store.incr_stat(Some(&self.queue), "running", -1).await?;
        store.incr_stat(Some(&self.queue), "processed", 1).await?;
        store
            .expire_job(&self.id, store.settings().expiry_time)
            .await?;
        self.settle_subjects(store, now).await?;

        events.emit(&Event::JobComplete {
            job_id: self.id.clone(),
        });
        tracing::info!(job_id = %self.id, queue = %self.queue, "job complete");
        Ok(())
    }

    /// Terminal cancellation, by handler request or remote override.
    pub async fn cancel(&mut self, store: &mut Store, events: &EventBus, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        self.status = JobStatus::Cancelled;
        self.finished = Some(now);
        self.override_reason = reason.to_string();
        self.touch();

        self.leave_flight(store).await?;
        store
            .archive(&self.queue, Archive::Cancelled, &self.payload, now)
            .await?;
        store
            .update_job_fields(
                &self.id,
                &[
                    ("status", JobStatus::Cancelled.as_i64().to_string()),
                    ("finished", now.to_string()),
                    ("override_reason", reason.to_string()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        store.incr_stat(Some(&self.queue), "running", -1).await?;
        store.incr_stat(Some(&self.queue), "cancelled", 1).await?;
        store
            .expire_job(&self.id, store.settings().expiry_time)
            .await?;
        self.settle_subjects(store, now).await?;

        events.emit(&Event::JobCancelled {
            job_id: self.id.clone(),
            reason: reason.to_string(),
        });
        tracing::info!(job_id = %self.id, queue = %self.queue, %reason, "job cancelled");
        Ok(())
    }

    /// The failure path. Records the error, then either re-queues directly
    /// (early failures), re-delays with exponential backoff, re-delays at an
    /// explicit time (`retry_delay`, which bypasses the threshold), or goes
    /// terminal FAILED once the threshold is reached.
    pub async fn fail(
        &mut self,
        store: &mut Store,
        events: &EventBus,
        error: &str,
        retry_delay: Option<i64>,
    ) -> Result<FailOutcome> {
        let now = Utc::now().timestamp();
        self.failed_count += 1;
        store
            .update_job_fields(&self.id, &[("failed_count", self.failed_count.to_string())])
            .await?;
        self.record_exception(store, error).await?;
        events.emit(&Event::JobFailure {
            job_id: self.id.clone(),
            error: error.to_string(),
        });

        if let Some(delay) = retry_delay {
            let run_at = resolve_run_at(now, delay);
            self.delay_retry(store, run_at, now).await?;
            return Ok(FailOutcome::Delayed(run_at));
        }

        let threshold = self.retry_threshold(store.settings().retry_threshold);
        if threshold != UNLIMITED_RETRIES && self.failed_count >= threshold {
            self.fail_terminal(store, now).await?;
            tracing::error!(
                job_id = %self.id,
                queue = %self.queue,
                failed_count = self.failed_count,
                %error,
                "job failed terminally"
            );
            return Ok(FailOutcome::Terminal);
        }

        if self.failed_count < DIRECT_REQUEUE_LIMIT {
            self.requeue_direct(store, now).await?;
            tracing::warn!(
                job_id = %self.id,
                queue = %self.queue,
                failed_count = self.failed_count,
                %error,
                "job re-queued after failure"
            );
            return Ok(FailOutcome::Requeued);
        }

        let run_at = now + backoff_delay_seconds(self.failed_count);
        self.delay_retry(store, run_at, now).await?;
        tracing::warn!(
            job_id = %self.id,
            queue = %self.queue,
            failed_count = self.failed_count,
            run_at,
            %error,
            "job re-delayed after failure"
        );
        Ok(FailOutcome::Delayed(run_at))
    }

    /// A payload left in the running set by an unregistered worker.
    /// Goes straight to FAILED, no retry evaluation.
    pub async fn fail_zombie(&mut self, store: &mut Store, events: &EventBus) -> Result<()> {
        let now = Utc::now().timestamp();
        self.failed_count += 1;
        store
            .update_job_fields(&self.id, &[("failed_count", self.failed_count.to_string())])
            .await?;
        let error = format!("Zombie: worker {} is no longer registered", self.worker);
        self.record_exception(store, &error).await?;
        events.emit(&Event::JobFailure {
            job_id: self.id.clone(),
            error: error.clone(),
        });
        self.fail_terminal(store, now).await?;
        tracing::error!(job_id = %self.id, queue = %self.queue, worker = %self.worker, "zombie job failed");
        Ok(())
    }

    async fn fail_terminal(&mut self, store: &mut Store, now: i64) -> Result<()> {
        self.status = JobStatus::Failed;
        self.finished = Some(now);
        self.touch();
        self.leave_flight(store).await?;
        store
            .archive(&self.queue, Archive::Failed, &self.payload, now)
            .await?;
        store
            .update_job_fields(
                &self.id,
                &[
                    ("status", JobStatus::Failed.as_i64().to_string()),
                    ("finished", now.to_string()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        store.incr_stat(Some(&self.queue), "running", -1).await?;
        store.incr_stat(Some(&self.queue), "failed", 1).await?;
        store
            .expire_job(&self.id, store.settings().expiry_time)
            .await?;
        self.settle_subjects(store, now).await?;
        Ok(())
    }

    async fn requeue_direct(&mut self, store: &mut Store, now: i64) -> Result<()> {
        self.status = JobStatus::Waiting;
        self.touch();
        let worker = self.worker.clone();
        let moved = store
            .requeue_direct(&self.queue, &worker, &self.payload)
            .await?;
        if !moved {
            // Not in flight anymore (crashed worker already drained); make
            // sure the payload is back on the waiting list regardless.
            store.push_waiting(&self.queue, &self.payload).await?;
        }
        store.remove_running(&self.queue, &self.payload).await?;
        store
            .archive(&self.queue, Archive::FailRetried, &self.payload, now)
            .await?;
        store
            .update_job_fields(
                &self.id,
                &[
                    ("status", JobStatus::Waiting.as_i64().to_string()),
                    ("worker", String::new()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        self.worker = String::new();
        store.incr_stat(Some(&self.queue), "running", -1).await?;
        store.incr_stat(Some(&self.queue), "queued", 1).await?;
        store.incr_stat(Some(&self.queue), "retried", 1).await?;
        Ok(())
    }

    async fn delay_retry(&mut self, store: &mut Store, run_at: i64, now: i64) -> Result<()> {
        self.status = JobStatus::Delayed;
        self.delayed = Some(run_at);
        self.touch();
        self.leave_flight(store).await?;
        store.add_delayed(&self.queue, &self.payload, run_at).await?;
        store
            .archive(&self.queue, Archive::FailRetried, &self.payload, now)
            .await?;
        store
            .update_job_fields(
                &self.id,
                &[
                    ("status", JobStatus::Delayed.as_i64().to_string()),
                    ("delayed", run_at.to_string()),
                    ("worker", String::new()),
                    ("updated", self.updated.to_string()),
                ],
            )
            .await?;
        self.worker = String::new();
        store.incr_stat(Some(&self.queue), "running", -1).await?;
        store.incr_stat(Some(&self.queue), "delayed", 1).await?;
        store.incr_stat(Some(&self.queue), "retried", 1).await?;
        Ok(())
    }

    /// Uniqueness admission: claim `unique:job:<signature>` for this job.
    /// A live non-terminal owner wins; anything else (no owner, ourselves,
    /// terminal owner, vanished hash) lets this job take the lock over.
    pub async fn admit_unique(
        &self,
        store: &mut Store,
        signature: &str,
        log_rejection: bool,
    ) -> Result<UniqueAdmission> {
        if store
            .acquire_unique(signature, &self.id, UNIQUE_LOCK_TTL_SECONDS)
            .await?
        {
            return Ok(UniqueAdmission::Admitted);
        }

        let owner = store.unique_owner(signature).await?;
        let takeover = match owner.as_deref() {
            None => true,
            Some(owner_id) if owner_id == self.id => true,
            Some(owner_id) => match store.load_job(owner_id).await? {
                None => true,
                Some(owner_job) => owner_job.status.is_terminal(),
            },
        };

        if takeover {
            store
                .seize_unique(signature, &self.id, UNIQUE_LOCK_TTL_SECONDS)
                .await?;
            return Ok(UniqueAdmission::Admitted);
        }

        store.push_duplicate(&self.payload).await?;
        if log_rejection {
            tracing::warn!(
                job_id = %self.id,
                %signature,
                owner = owner.as_deref().unwrap_or(""),
                "duplicate job rejected by uniqueness lock"
            );
        }
        Ok(UniqueAdmission::Rejected)
    }
}

fn string_or_list(data: &Value, field: &str) -> Vec<String> {
    match data.get(field) {
        Some(Value::String(value)) if !value.is_empty() => vec![value.clone()],
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_are_22_chars_and_distinct() {
        let data = json!({"x": 1});
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let id = generate_id("q", "Echo", &data, 0);
            assert_eq!(id.len(), ID_LENGTH);
            assert!(id.bytes().all(|byte| byte.is_ascii_alphanumeric()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn payload_encoding_is_deterministic() {
        let payload = JobPayload {
            id: "abc".to_string(),
            class: "Echo".to_string(),
            data: json!({"b": 2, "a": 1}),
        };
        let first = payload.encode().unwrap();
        let second = JobPayload::decode(&first).unwrap().encode().unwrap();
        assert_eq!(first, second);
        // Sorted object keys regardless of construction order.
        assert!(first.find("\"a\":1").unwrap() < first.find("\"b\":2").unwrap());
    }

    #[test]
    fn status_values_round_trip() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Delayed,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_i64()), Some(status));
        }
        assert_eq!(JobStatus::parse(0), None);
        assert_eq!(JobStatus::Complete.as_i64(), 4);
    }

    #[test]
    fn build_rejects_empty_queue_and_class() {
        assert!(Job::build("", "Echo", Value::Null, 0).is_err());
        assert!(Job::build("q", "", Value::Null, 0).is_err());
        assert!(Job::build("q", "@method", Value::Null, 0).is_err());
        assert!(Job::build("q", "Echo@run", Value::Null, 0).is_ok());
    }

    #[test]
    fn resolve_run_at_splits_relative_and_absolute() {
        let now = 1_700_000_000;
        assert_eq!(resolve_run_at(now, 30), now + 30);
        assert_eq!(resolve_run_at(now, -5), now);
        // Anything at or past the ceiling is an absolute epoch.
        assert_eq!(
            resolve_run_at(now, RELATIVE_DELAY_CEILING),
            RELATIVE_DELAY_CEILING
        );
        assert_eq!(resolve_run_at(now, 1_800_000_000), 1_800_000_000);
    }

    #[test]
    fn backoff_window_matches_failure_count() {
        for _ in 0..100 {
            let delay = backoff_delay_seconds(2);
            assert!((2..=4).contains(&delay), "delay {delay} outside [2, 4]");
        }
        for _ in 0..100 {
            let delay = backoff_delay_seconds(3);
            assert!((4..=8).contains(&delay), "delay {delay} outside [4, 8]");
        }
        // Large counts clamp to the cap.
        for _ in 0..20 {
            assert!(backoff_delay_seconds(12) <= BACKOFF_CAP_SECONDS);
        }
    }

    #[test]
    fn retry_threshold_prefers_job_data() {
        let job = Job::build("q", "Echo", json!({"retry_threshold": -2}), 0).unwrap();
        assert_eq!(job.retry_threshold(3), -2);
        let job = Job::build("q", "Echo", json!({}), 0).unwrap();
        assert_eq!(job.retry_threshold(3), 3);
    }

    #[test]
    fn subject_and_series_accept_string_or_list() {
        let job = Job::build(
            "q",
            "Echo",
            json!({"subject": "s1", "series_id": ["a", "b"]}),
            0,
        )
        .unwrap();
        assert_eq!(job.subjects(), vec!["s1"]);
        assert_eq!(job.series_id, vec!["a", "b"]);
    }
}
