use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};

use crate::commands::shared::{default_registry, init_store};
use forq::client::Producer;
use forq::events::EventBus;

pub async fn enqueue(
    config: Option<&str>,
    queue: &str,
    class: &str,
    data: Option<&str>,
    run_at: Option<i64>,
    delay: Option<i64>,
) -> Result<()> {
    let (_, store) = init_store(config).await?;
    let data: Value = match data {
        Some(raw) => serde_json::from_str(raw).context("--data must be valid JSON")?,
        None => json!({}),
    };
    let run_at = match (run_at, delay) {
        (Some(epoch), _) => epoch,
        (None, Some(seconds)) => Utc::now().timestamp() + seconds.max(0),
        (None, None) => 0,
    };

    let mut producer = Producer::new(store, default_registry(), Arc::new(EventBus::new()));
    match producer.enqueue(queue, class, data, run_at).await? {
        Some(job) => println!("{}", job.id),
        None => println!("rejected"),
    }
    Ok(())
}

pub async fn show(config: Option<&str>, job_id: &str) -> Result<()> {
    let (_, mut store) = init_store(config).await?;
    let Some(job) = store.load_job(job_id).await? else {
        anyhow::bail!("job {job_id} not found");
    };
    let view = json!({
        "id": job.id,
        "queue": job.queue,
        "class": job.class,
        "status": job.status.as_str(),
        "data": job.data,
        "created": job.created,
        "updated": job.updated,
        "started": job.started,
        "finished": job.finished,
        "delayed": job.delayed,
        "failed_count": job.failed_count,
        "progress": job.progress,
        "worker": job.worker,
        "latest_line": job.latest_line,
        "exception": job.exception,
        "series_id": job.series_id,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

pub async fn cancel(config: Option<&str>, job_id: &str, reason: &str) -> Result<()> {
    let (_, store) = init_store(config).await?;
    let mut producer = Producer::new(store, default_registry(), Arc::new(EventBus::new()));
    if producer.request_cancel(job_id, reason).await? {
        println!("cancel requested for {job_id}");
    } else {
        anyhow::bail!("job {job_id} not found");
    }
    Ok(())
}
