use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};

use crate::store::Store;
use forq_config::ForqSettings;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serialized access to a flushed Redis test database. Tests hold the guard
/// for their whole body so counters and scans never interleave.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: ForqSettings,
    pub store: Store,
    pub conn: redis::aio::MultiplexedConnection,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = ForqSettings::default();
        settings.redis_dsn = std::env::var("FORQ_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        settings.interval = 0.1;

        let client = redis::Client::open(settings.redis_dsn.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let mut store = Store::with_connection(settings.clone(), conn.clone());
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            store,
            conn,
        })
    }
}
