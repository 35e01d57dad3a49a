//! Queue dispatch. A successful claim atomically moves the payload from the
//! waiting list into the worker's processing list; nothing is mutated on a
//! miss.

use anyhow::Result;
use chrono::Utc;

use crate::events::{Event, EventBus};
use crate::job::Job;
use crate::store::Store;

/// Expand the configured queue list. `*` means every known queue, in
/// ascending lexicographic order; an explicit list keeps its order.
pub async fn resolve_queues(store: &mut Store, configured: &[String]) -> Result<Vec<String>> {
    if configured.iter().any(|queue| queue == "*") {
        return store.known_queues().await;
    }
    let mut queues = Vec::with_capacity(configured.len());
    for queue in configured {
        if !queue.is_empty() && !queues.contains(queue) {
            queues.push(queue.clone());
        }
    }
    Ok(queues)
}

/// Move due delayed payloads into their waiting lists, adjusting counters.
/// Returns the number of promoted payloads per call.
pub async fn promote_due(store: &mut Store, queue: &str) -> Result<i64> {
    let now = Utc::now().timestamp();
    let moved = store.promote_delayed(queue, now).await?;
    if moved > 0 {
        store.incr_stat(Some(queue), "delayed", -moved).await?;
        store.incr_stat(Some(queue), "queued", moved).await?;
        tracing::debug!(%queue, moved, "promoted delayed jobs");
    }
    Ok(moved)
}

/// Claim one job from the given queues. Blocking mode tries each queue once
/// with a blocking right-pop-left-push and the given timeout; polling mode
/// makes one non-blocking attempt per queue and returns the first hit.
pub async fn claim(
    store: &mut Store,
    events: &EventBus,
    queues: &[String],
    timeout_seconds: f64,
    blocking: bool,
    worker_id: &str,
) -> Result<Option<Job>> {
    for queue in queues {
        let popped = if blocking {
            store.blocking_pop(queue, worker_id, timeout_seconds).await?
        } else {
            store.pop(queue, worker_id).await?
        };
        let Some(raw) = popped else {
            continue;
        };

        let mut job = Job::from_claimed_payload(store, queue, &raw).await?;
        job.mark_running(store, worker_id).await?;
        events.emit(&Event::JobRunning {
            job_id: job.id.clone(),
            worker_id: worker_id.to_string(),
        });
        tracing::info!(
            job_id = %job.id,
            %queue,
            worker = %worker_id,
            class = %job.class,
            "job claimed"
        );
        return Ok(Some(job));
    }
    Ok(None)
}

/// Counter snapshot of one queue, for introspection commands.
#[derive(Debug, Clone, Default)]
pub struct QueueCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub running: i64,
}

pub async fn counts(store: &mut Store, queue: &str) -> Result<QueueCounts> {
    Ok(QueueCounts {
        waiting: store.waiting_len(queue).await?,
        delayed: store.delayed_len(queue).await?,
        running: store.queue_stat(queue, "running").await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::job::JobStatus;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_queues_expands_star_sorted() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        ctx.store.register_queue("zeta").await.unwrap();
        ctx.store.register_queue("alpha").await.unwrap();
        let resolved = resolve_queues(&mut ctx.store, &["*".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved, vec!["alpha", "zeta"]);

        let explicit = resolve_queues(
            &mut ctx.store,
            &["zeta".to_string(), "alpha".to_string(), "zeta".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(explicit, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn claim_moves_payload_and_marks_running() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let events = EventBus::new();
        let worker = "host:7:0.0.0";

        let job = Job::build("mail", "Echo", json!({"x": 1}), 0).unwrap();
        ctx.store.save_job(&job).await.unwrap();
        ctx.store.register_queue("mail").await.unwrap();
        ctx.store.push_waiting("mail", &job.payload).await.unwrap();
        ctx.store.incr_stat(Some("mail"), "queued", 1).await.unwrap();

        let claimed = claim(
            &mut ctx.store,
            &events,
            &["mail".to_string()],
            0.0,
            false,
            worker,
        )
        .await
        .unwrap()
        .expect("job claimed");

        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker, worker);
        assert_eq!(ctx.store.waiting_len("mail").await.unwrap(), 0);
        assert_eq!(ctx.store.processing_len("mail", worker).await.unwrap(), 1);
        assert_eq!(ctx.store.stat("queued").await.unwrap(), 0);
        assert_eq!(ctx.store.stat("running").await.unwrap(), 1);

        let stored = ctx.store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.worker, worker);
    }

    #[tokio::test]
    async fn claim_returns_none_on_empty_queues() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let events = EventBus::new();
        let claimed = claim(
            &mut ctx.store,
            &events,
            &["empty".to_string()],
            0.0,
            false,
            "host:7:0.0.0",
        )
        .await
        .unwrap();
        assert!(claimed.is_none());
        assert_eq!(ctx.store.processing_len("empty", "host:7:0.0.0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promote_due_round_trips_payload_untouched() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let job = Job::build("mail", "Echo", json!({"k": "v"}), 9_999_999_999).unwrap();
        ctx.store.save_job(&job).await.unwrap();
        ctx.store
            .add_delayed("mail", &job.payload, 100)
            .await
            .unwrap();
        ctx.store.incr_stat(Some("mail"), "delayed", 1).await.unwrap();

        let moved = promote_due(&mut ctx.store, "mail").await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(ctx.store.stat("delayed").await.unwrap(), 0);
        assert_eq!(ctx.store.stat("queued").await.unwrap(), 1);

        let popped = ctx.store.pop("mail", "w").await.unwrap().unwrap();
        assert_eq!(popped, job.payload);
    }
}
