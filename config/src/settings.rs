use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_CLEANUP_CYCLE_SECONDS, DEFAULT_EXPIRY_TIME_SECONDS,
    DEFAULT_HEARTBEAT_INTERVAL_SECONDS, DEFAULT_INTERVAL_SECONDS, DEFAULT_JOB_TIMEOUT_SECONDS,
    DEFAULT_JOB_WALL_CAP_SECONDS, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_REDIS_DSN,
    DEFAULT_RETRY_THRESHOLD, DEFAULT_UNIQUE_LOCK_TTL_SECONDS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ForqSettings {
    pub redis_dsn: String,
    /// Optional prefix applied to every Redis key.
    pub namespace: Option<String>,
    /// Queues this worker watches; `*` expands to all known queues.
    pub queues: Vec<String>,
    /// Blocking right-pop-left-push vs. polling claims.
    pub blocking: bool,
    /// Loop sleep and blocking-pop timeout, seconds.
    pub interval: f64,
    /// Per-job wall-clock limit, seconds.
    pub timeout: i64,
    /// Soft resident-memory ceiling in MB.
    pub memory_limit: i64,
    /// TTL for terminal job hashes and orphaned worker hashes.
    pub expiry_time: i64,
    pub retry_threshold: i64,
    /// Honor the cluster-wide dedicated-worker gate.
    pub dedicated_lock: bool,
    pub cleanup_cycle_seconds: i64,
    pub heartbeat_interval_seconds: f64,
    pub job_wall_cap_seconds: i64,
    pub unique_lock_ttl_seconds: i64,
    /// Executable spawned for job isolation. Defaults to the current binary.
    pub worker_exec: Option<String>,
}

impl Default for ForqSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            namespace: None,
            queues: vec!["*".to_string()],
            blocking: true,
            interval: DEFAULT_INTERVAL_SECONDS,
            timeout: DEFAULT_JOB_TIMEOUT_SECONDS,
            memory_limit: DEFAULT_MEMORY_LIMIT_MB,
            expiry_time: DEFAULT_EXPIRY_TIME_SECONDS,
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            dedicated_lock: true,
            cleanup_cycle_seconds: DEFAULT_CLEANUP_CYCLE_SECONDS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            job_wall_cap_seconds: DEFAULT_JOB_WALL_CAP_SECONDS,
            unique_lock_ttl_seconds: DEFAULT_UNIQUE_LOCK_TTL_SECONDS,
            worker_exec: None,
        }
    }
}
