pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";

/// Loop sleep and blocking-pop timeout, in seconds.
pub const DEFAULT_INTERVAL_SECONDS: f64 = 5.0;
/// Per-job wall-clock limit enforced in the child, in seconds.
pub const DEFAULT_JOB_TIMEOUT_SECONDS: i64 = 1800;
/// Soft resident-memory ceiling for a worker, in MB.
pub const DEFAULT_MEMORY_LIMIT_MB: i64 = 1024;
/// TTL applied to terminal job hashes and orphaned worker hashes.
pub const DEFAULT_EXPIRY_TIME_SECONDS: i64 = 86_400;
/// Failures before a job goes terminal FAILED. -2 means unlimited.
pub const DEFAULT_RETRY_THRESHOLD: i64 = 3;

pub const DEFAULT_CLEANUP_CYCLE_SECONDS: i64 = 120;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: f64 = 5.0;
/// Hard cap on a single claimed job, parent-enforced.
pub const DEFAULT_JOB_WALL_CAP_SECONDS: i64 = 3_600;
pub const DEFAULT_UNIQUE_LOCK_TTL_SECONDS: i64 = 7_200;
