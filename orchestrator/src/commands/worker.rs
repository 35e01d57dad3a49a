use std::sync::Arc;

use anyhow::Result;

use crate::commands::shared::{default_registry, init_store};
use forq::events::EventBus;
use forq::worker::{Worker, remove_dedicated, set_dedicated};
use forq_config::load_settings;

pub async fn run_worker(
    config: Option<&str>,
    queues: Vec<String>,
    poll: bool,
) -> Result<()> {
    let mut settings = load_settings(config)?;
    if !queues.is_empty() {
        settings.queues = queues;
    }
    if poll {
        settings.blocking = false;
    }

    let events = Arc::new(EventBus::new());
    let mut worker = Worker::new(settings, events).await?;
    tracing::info!(worker = %worker.id(), "starting worker loop");
    worker.work().await
}

/// Hidden child entry: executes one claimed job and exits. Non-zero exit
/// tells the waiting parent that no terminal state was recorded.
pub async fn exec_job(
    config: Option<&str>,
    job_id: &str,
    queue: &str,
    worker_id: &str,
) -> Result<i32> {
    let settings = load_settings(config)?;
    let registry = default_registry();
    let events = Arc::new(EventBus::new());
    forq::executor::run_child(settings, registry, events, job_id, queue, worker_id).await
}

pub async fn dedicated_set(config: Option<&str>, worker_id: &str) -> Result<()> {
    let (_, mut store) = init_store(config).await?;
    set_dedicated(&mut store, worker_id).await?;
    println!("dedicated worker set to {worker_id}");
    Ok(())
}

pub async fn dedicated_remove(config: Option<&str>) -> Result<()> {
    let (_, mut store) = init_store(config).await?;
    remove_dedicated(&mut store).await?;
    println!("dedicated gate cleared");
    Ok(())
}
