//! Canonical Redis keyspace for the job processor. Every key goes through
//! [`Keys`] so the optional namespace prefix is applied in exactly one place.

/// TTL of a uniqueness-signature lock.
pub const UNIQUE_LOCK_TTL_SECONDS: i64 = 7_200;
/// Cap on the rejected-by-uniqueness tail list.
pub const DUPLICATES_MAX_LEN: isize = 300;
/// Bounded per-job exception history.
pub const EXCEPTION_HISTORY_MAX: usize = 5;
/// Approximate cap on a per-job output stream.
pub const OUTPUT_STREAM_MAXLEN: i64 = 1_000;
pub const OUTPUT_STREAM_TTL_SECONDS: i64 = 86_400;

/// Retry delays below this value are relative seconds; above, absolute epoch.
pub const RELATIVE_DELAY_CEILING: i64 = 94_608_000;
/// Failures up to this count are re-queued directly, with no backoff.
pub const DIRECT_REQUEUE_LIMIT: i64 = 2;
/// Exponential backoff is clamped to this many seconds.
pub const BACKOFF_CAP_SECONDS: i64 = 180;
/// `retry_threshold` value meaning "retry forever".
pub const UNLIMITED_RETRIES: i64 = -2;

/// Terminal archives kept per queue, scored by finish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Archive {
    Processed,
    Cancelled,
    Failed,
    FailRetried,
}

impl Archive {
    pub fn as_str(self) -> &'static str {
        match self {
            Archive::Processed => "processed",
            Archive::Cancelled => "cancelled",
            Archive::Failed => "failed",
            Archive::FailRetried => "fail_retried",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(namespace: Option<&str>) -> Self {
        let prefix = match namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}:"),
            _ => String::new(),
        };
        Self { prefix }
    }

    fn k(&self, raw: &str) -> String {
        format!("{}{raw}", self.prefix)
    }

    pub fn queues(&self) -> String {
        self.k("queues")
    }

    pub fn queue(&self, queue: &str) -> String {
        self.k(&format!("queue:{queue}"))
    }

    pub fn queue_delayed(&self, queue: &str) -> String {
        self.k(&format!("queue:{queue}:delayed"))
    }

    pub fn queue_running(&self, queue: &str) -> String {
        self.k(&format!("queue:{queue}:running"))
    }

    pub fn queue_archive(&self, queue: &str, archive: Archive) -> String {
        self.k(&format!("queue:{queue}:{}", archive.as_str()))
    }

    pub fn queue_stats(&self, queue: &str) -> String {
        self.k(&format!("queue:{queue}:stats"))
    }

    pub fn processing_list(&self, queue: &str, worker_id: &str) -> String {
        self.k(&format!("queue:{queue}:{worker_id}:processing_list"))
    }

    pub fn stats(&self) -> String {
        self.k("stats")
    }

    pub fn job(&self, job_id: &str) -> String {
        self.k(&format!("job:{job_id}"))
    }

    pub fn job_output(&self, job_id: &str) -> String {
        self.k(&format!("job:{job_id}:output"))
    }

    pub fn workers(&self) -> String {
        self.k("workers")
    }

    pub fn worker(&self, worker_id: &str) -> String {
        self.k(&format!("worker:{worker_id}"))
    }

    pub fn hosts(&self) -> String {
        self.k("hosts")
    }

    pub fn host(&self, host: &str) -> String {
        self.k(&format!("host:{host}"))
    }

    pub fn unique_job(&self, signature: &str) -> String {
        self.k(&format!("unique:job:{signature}"))
    }

    pub fn global(&self) -> String {
        self.k("global")
    }

    pub fn subject_pending(&self, subject: &str) -> String {
        self.k(&format!("jobsubject:pending:{subject}"))
    }

    pub fn subject_done(&self, subject: &str) -> String {
        self.k(&format!("jobsubject:done:{subject}"))
    }

    pub fn series(&self, series_id: &str) -> String {
        self.k(&format!("jobseries:{series_id}"))
    }

    pub fn duplicates(&self) -> String {
        self.k("duplicates")
    }

    pub fn aggregate_output(&self) -> String {
        self.k("bot-output")
    }

    /// Pub/sub channel for handler-supplied channels. Not namespaced: the
    /// channel space is shared with external subscribers.
    pub fn job_channel(&self, channel: &str) -> String {
        format!("bot-channel-{channel}")
    }

    pub fn job_stat(&self, presentation: &str) -> String {
        self.k(&format!("jobs:stat:{presentation}"))
    }

    pub fn jobs_time(&self) -> String {
        self.k("jobs:time")
    }

    pub fn jobs_count(&self) -> String {
        self.k("jobs:count")
    }
}
