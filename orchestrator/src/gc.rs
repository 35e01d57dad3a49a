//! Recovery sweeps: zombie jobs, dead workers, abandoned processing lists.
//! Run at worker startup and on every cleanup cycle, so state converges
//! after ungraceful termination anywhere in the fleet.

use anyhow::Result;
use chrono::Utc;

use crate::constants::Archive;
use crate::events::EventBus;
use crate::job::Job;
use crate::store::Store;

/// Fail every running-set payload whose recorded worker is no longer
/// registered. Returns the number of zombies recovered.
pub async fn sweep_zombie_jobs(
    store: &mut Store,
    events: &EventBus,
    queues: &[String],
) -> Result<usize> {
    let now = Utc::now().timestamp();
    let workers = store.workers().await?;
    let mut recovered = 0;

    for queue in queues {
        let payloads = store.running_started_before(queue, now).await?;
        for payload in payloads {
            let mut job = match Job::from_claimed_payload(store, queue, &payload).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(%queue, error = %err, "dropping undecodable running entry");
                    store.remove_running(queue, &payload).await?;
                    continue;
                }
            };
            if !job.worker.is_empty() && workers.contains(&job.worker) {
                continue;
            }
            job.fail_zombie(store, events).await?;
            recovered += 1;
        }
    }
    Ok(recovered)
}

/// Force-unregister dead workers. A worker is dead when its host is still
/// alive but no longer lists it, or when it claims to live on this host and
/// its pid no longer exists. Dead workers' processing lists are drained back
/// into their queues first, so no claimed payload is lost.
pub async fn prune_workers(store: &mut Store, our_host: &str) -> Result<usize> {
    let workers = store.workers().await?;
    let hosts = store.hosts().await?;
    let queues = store.known_queues().await?;
    let mut pruned = 0;

    for worker_id in workers {
        let Some((host, pid)) = parse_worker_id(&worker_id) else {
            tracing::warn!(worker = %worker_id, "removing malformed worker id");
            force_unregister(store, &worker_id, None, &queues).await?;
            pruned += 1;
            continue;
        };

        let dead = if host == our_host {
            !pid_alive(pid)
        } else {
            hosts.contains(&host.to_string()) && !store.host_contains(host, &worker_id).await?
        };

        if dead {
            tracing::warn!(worker = %worker_id, %host, "pruning dead worker");
            force_unregister(store, &worker_id, Some(host), &queues).await?;
            pruned += 1;
        }
    }
    Ok(pruned)
}

/// Drain a worker's processing lists back into their queues and remove it
/// from every registry index.
pub async fn force_unregister(
    store: &mut Store,
    worker_id: &str,
    host: Option<&str>,
    queues: &[String],
) -> Result<()> {
    for queue in queues {
        requeue_processing(store, queue, worker_id).await?;
    }
    store.remove_worker(worker_id).await?;
    if let Some(host) = host {
        store.remove_host_worker(host, worker_id).await?;
    }
    Ok(())
}

/// Drain this worker's processing lists, then delete its auxiliary keys
/// (the worker-named dedicated queue and its stats). Run at startup and on
/// unregister.
pub async fn cleanup_queues(store: &mut Store, worker_id: &str) -> Result<usize> {
    let queues = store.known_queues().await?;
    let mut drained = 0;
    for queue in &queues {
        drained += requeue_processing(store, queue, worker_id).await?;
    }
    store.unregister_queue(worker_id).await?;
    Ok(drained)
}

async fn requeue_processing(store: &mut Store, queue: &str, worker_id: &str) -> Result<usize> {
    let moved = store.drain_processing(queue, worker_id).await?;
    if moved.is_empty() {
        return Ok(0);
    }
    let count = moved.len() as i64;
    store.incr_stat(Some(queue), "running", -count).await?;
    store.incr_stat(Some(queue), "queued", count).await?;
    for payload in &moved {
        store.remove_running(queue, payload).await?;
        if let Ok(decoded) = crate::job::JobPayload::decode(payload) {
            store
                .update_job_fields(
                    &decoded.id,
                    &[
                        ("status", crate::job::JobStatus::Waiting.as_i64().to_string()),
                        ("worker", String::new()),
                    ],
                )
                .await?;
        }
    }
    tracing::info!(%queue, worker = %worker_id, count, "drained processing list back to queue");
    Ok(moved.len())
}

/// TTL-mark hashes under `worker:<our_host>:*` that are not in the roster,
/// so crashed-worker leftovers age out instead of accumulating.
pub async fn mark_orphan_worker_hashes(store: &mut Store, our_host: &str) -> Result<usize> {
    let pattern = store.keys().worker(&format!("{our_host}:*"));
    let prefix = store.keys().worker("");
    let hash_keys = store.scan_keys(&pattern).await?;
    let expiry = store.settings().expiry_time;
    let mut marked = 0;
    for key in hash_keys {
        let Some(worker_id) = key.strip_prefix(&prefix) else {
            continue;
        };
        let worker_id = worker_id.to_string();
        if !store.is_worker(&worker_id).await? {
            store.expire_worker_hash(&worker_id, expiry).await?;
            marked += 1;
        }
    }
    Ok(marked)
}

/// Trim processed archives older than the configured expiry.
pub async fn trim_archives(store: &mut Store, queues: &[String]) -> Result<()> {
    let cutoff = Utc::now().timestamp() - store.settings().expiry_time;
    for queue in queues {
        store.trim_archive(queue, Archive::Processed, cutoff).await?;
    }
    Ok(())
}

fn parse_worker_id(worker_id: &str) -> Option<(&str, i32)> {
    let mut parts = worker_id.rsplitn(3, ':');
    let _version = parts.next()?;
    let pid: i32 = parts.next()?.parse().ok()?;
    let host = parts.next()?;
    if host.is_empty() {
        return None;
    }
    Some((host, pid))
}

fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::job::JobStatus;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    #[test]
    fn worker_id_parsing() {
        assert_eq!(parse_worker_id("box-1:42:0.4.2"), Some(("box-1", 42)));
        // Hostnames may contain colons only if they parse from the right.
        assert_eq!(parse_worker_id("a:b:42:0.4.2"), Some(("a:b", 42)));
        assert_eq!(parse_worker_id("no-pid"), None);
        assert_eq!(parse_worker_id("box:nan:0.4.2"), None);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
        // A pid from the far end of the range is almost surely free.
        assert!(!pid_alive(i32::MAX - 7));
    }

    #[tokio::test]
    async fn zombie_sweep_fails_orphaned_running_jobs() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let events = EventBus::new();
        let dead_worker = "gone:1:0.0.0";

        let job = Job::build("mail", "Echo", json!({}), 0).unwrap();
        ctx.store.save_job(&job).await.unwrap();
        ctx.store.register_queue("mail").await.unwrap();
        ctx.store.push_waiting("mail", &job.payload).await.unwrap();
        ctx.store.incr_stat(Some("mail"), "queued", 1).await.unwrap();
        let raw = ctx.store.pop("mail", dead_worker).await.unwrap().unwrap();
        let mut claimed = Job::from_claimed_payload(&mut ctx.store, "mail", &raw)
            .await
            .unwrap();
        claimed.mark_running(&mut ctx.store, dead_worker).await.unwrap();

        // The dead worker is not in the worker set.
        let recovered = sweep_zombie_jobs(&mut ctx.store, &events, &["mail".to_string()])
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let failed = ctx.store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.exception[0].contains("Zombie"));
        assert!(
            ctx.store
                .archive_contains("mail", Archive::Failed, &claimed.payload)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn zombie_sweep_spares_live_workers() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let events = EventBus::new();
        let live_worker = "here:2:0.0.0";
        ctx.store.add_worker(live_worker).await.unwrap();

        let job = Job::build("mail", "Echo", json!({}), 0).unwrap();
        ctx.store.save_job(&job).await.unwrap();
        ctx.store.push_waiting("mail", &job.payload).await.unwrap();
        let raw = ctx.store.pop("mail", live_worker).await.unwrap().unwrap();
        let mut claimed = Job::from_claimed_payload(&mut ctx.store, "mail", &raw)
            .await
            .unwrap();
        claimed.mark_running(&mut ctx.store, live_worker).await.unwrap();

        let recovered = sweep_zombie_jobs(&mut ctx.store, &events, &["mail".to_string()])
            .await
            .unwrap();
        assert_eq!(recovered, 0);
        let still = ctx.store.load_job(&job.id).await.unwrap().unwrap();
        assert_eq!(still.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cleanup_queues_drains_processing_back_to_waiting() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let worker = "box:3:0.0.0";
        ctx.store.register_queue("mail").await.unwrap();
        ctx.store.push_waiting("mail", "p1").await.unwrap();
        ctx.store.push_waiting("mail", "p2").await.unwrap();
        ctx.store.pop("mail", worker).await.unwrap();
        ctx.store.pop("mail", worker).await.unwrap();
        assert_eq!(ctx.store.waiting_len("mail").await.unwrap(), 0);

        let drained = cleanup_queues(&mut ctx.store, worker).await.unwrap();
        assert_eq!(drained, 2);
        assert_eq!(ctx.store.waiting_len("mail").await.unwrap(), 2);
        assert_eq!(ctx.store.processing_len("mail", worker).await.unwrap(), 0);
        // The worker-named auxiliary queue is gone from the registry.
        assert!(!ctx.store.known_queues().await.unwrap().contains(&worker.to_string()));
    }

    #[tokio::test]
    async fn prune_removes_peer_missing_from_host_set() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        // Peer host is alive but does not list this worker anymore.
        let stale = "peer-box:99:0.0.0";
        ctx.store.add_worker(stale).await.unwrap();
        ctx.store.add_host("peer-box").await.unwrap();

        let pruned = prune_workers(&mut ctx.store, "our-box").await.unwrap();
        assert_eq!(pruned, 1);
        assert!(!ctx.store.is_worker(stale).await.unwrap());
    }

    #[tokio::test]
    async fn prune_removes_local_worker_with_dead_pid() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let host = "our-box";
        let stale = format!("{host}:{}:0.0.0", i32::MAX - 11);
        ctx.store.add_worker(&stale).await.unwrap();
        ctx.store.add_host(host).await.unwrap();
        ctx.store.add_host_worker(host, &stale).await.unwrap();

        let pruned = prune_workers(&mut ctx.store, host).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(!ctx.store.is_worker(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn orphan_worker_hashes_get_ttl_marked() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let orphan = "our-box:500:0.0.0";
        ctx.store
            .save_worker_fields(orphan, &[("status", "RUNNING".to_string())])
            .await
            .unwrap();

        let marked = mark_orphan_worker_hashes(&mut ctx.store, "our-box")
            .await
            .unwrap();
        assert_eq!(marked, 1);

        let key = ctx.store.keys().worker(orphan);
        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut ctx.conn)
            .await
            .unwrap();
        assert!(ttl > 0);
    }
}
