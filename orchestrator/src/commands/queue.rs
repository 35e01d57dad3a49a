use anyhow::Result;

use crate::commands::shared::init_store;
use forq::queue::counts;

pub async fn list(config: Option<&str>) -> Result<()> {
    let (_, mut store) = init_store(config).await?;
    let queues = store.known_queues().await?;
    if queues.is_empty() {
        println!("no queues");
        return Ok(());
    }
    for queue in queues {
        let snapshot = counts(&mut store, &queue).await?;
        println!(
            "{queue}: waiting={} delayed={} running={}",
            snapshot.waiting, snapshot.delayed, snapshot.running
        );
    }
    Ok(())
}

pub async fn stats(config: Option<&str>) -> Result<()> {
    let (_, mut store) = init_store(config).await?;
    for field in [
        "queued",
        "running",
        "processed",
        "cancelled",
        "failed",
        "delayed",
        "retried",
        "total",
    ] {
        println!("{field}: {}", store.stat(field).await?);
    }
    Ok(())
}
