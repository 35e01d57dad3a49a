//! Worker runtime. One single-threaded claim loop per process; every
//! claimed job runs in a child process spawned from this same executable,
//! so the process boundary is the failure firewall. Redis is the only state
//! shared between parent and child.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::events::{Event, EventBus};
use crate::gc;
use crate::host::{HostRegistry, detect_hostname};
use crate::job::{Job, JobStatus};
use crate::queue;
use crate::store::Store;
use forq_config::ForqSettings;

pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

const CHILD_POLL_SLEEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Running,
    Paused,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::New => "NEW",
            WorkerState::Running => "RUNNING",
            WorkerState::Paused => "PAUSED",
        }
    }
}

/// Commands delivered to the main loop over a single-consumer channel. OS
/// signals and remote signals both map onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    ForceShutdown,
    Shutdown,
    CancelJob,
    Pause,
    Resume,
    Wakeup,
    Reconnect,
}

/// Textual remote-signal slot values, as written into the `global` hash or
/// a worker hash by an operator.
pub fn parse_remote_signal(value: &str) -> Option<WorkerCommand> {
    match value.to_ascii_uppercase().as_str() {
        "FORCESHUTDOWN" => Some(WorkerCommand::ForceShutdown),
        "QUIT" | "SHUTDOWN" => Some(WorkerCommand::Shutdown),
        "CANCEL" => Some(WorkerCommand::CancelJob),
        "PAUSE" => Some(WorkerCommand::Pause),
        "RESUME" | "CONT" => Some(WorkerCommand::Resume),
        "WAKEUP" => Some(WorkerCommand::Wakeup),
        _ => None,
    }
}

/// Name the single worker allowed to execute while the fleet is gated.
pub async fn set_dedicated(store: &mut Store, worker_id: &str) -> Result<()> {
    store.set_global_field("dedicated", worker_id).await
}

/// Clear the dedicated gate and bump the cluster token so gated workers
/// notice the change.
pub async fn remove_dedicated(store: &mut Store) -> Result<()> {
    store.del_global_field("dedicated").await?;
    store.incr_global_field("cluster").await?;
    Ok(())
}

pub struct Worker {
    settings: ForqSettings,
    store: Store,
    events: Arc<EventBus>,
    id: String,
    host: HostRegistry,
    state: WorkerState,
    shutdown: bool,
    force_shutdown: bool,
    commands_tx: mpsc::UnboundedSender<WorkerCommand>,
    commands_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    last_g_signal: String,
    last_memory_decile: i64,
    dedicated_gated: bool,
}

impl Worker {
    pub async fn new(settings: ForqSettings, events: Arc<EventBus>) -> Result<Self> {
        let store = Store::new(settings.clone()).await?;
        Ok(Self::with_store(settings, store, events))
    }

    pub fn with_store(settings: ForqSettings, store: Store, events: Arc<EventBus>) -> Self {
        let hostname = detect_hostname();
        let id = format!("{hostname}:{}:{RUNTIME_VERSION}", std::process::id());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        events.emit(&Event::WorkerInstance {
            worker_id: id.clone(),
        });
        Self {
            settings,
            store,
            events,
            id,
            host: HostRegistry::new(hostname),
            state: WorkerState::New,
            shutdown: false,
            force_shutdown: false,
            commands_tx,
            commands_rx,
            last_g_signal: String::new(),
            last_memory_decile: 0,
            dedicated_gated: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Channel used by the OS signal handlers; also handy for embedders.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<WorkerCommand> {
        self.commands_tx.clone()
    }

    /// The main loop. Returns once the worker has unregistered.
    pub async fn work(&mut self) -> Result<()> {
        self.install_signal_handlers();
        self.events.emit(&Event::WorkerStartup {
            worker_id: self.id.clone(),
        });
        tracing::info!(worker = %self.id, queues = ?self.settings.queues, "worker starting");

        self.run_cleanup("startup").await?;
        self.register().await?;
        self.state = WorkerState::Running;
        let interval = Duration::from_secs_f64(self.settings.interval.max(0.01));
        let cleanup_cycle = Duration::from_secs(self.settings.cleanup_cycle_seconds.max(1) as u64);
        let mut last_cleanup = Instant::now();

        loop {
            self.drain_commands(None).await;
            if self.force_shutdown || self.shutdown {
                break;
            }

            if last_cleanup.elapsed() >= cleanup_cycle {
                self.run_cleanup("cycle").await?;
                last_cleanup = Instant::now();
                if detect_hostname() != self.host.name() {
                    tracing::error!(
                        worker = %self.id,
                        "hostname changed; shutting down, operator must re-register"
                    );
                    break;
                }
            }

            self.poll_remote_signals().await?;
            self.drain_commands(None).await;
            if self.force_shutdown || self.shutdown {
                break;
            }

            if self.dedicated_gate_active().await? {
                sleep(interval).await;
                continue;
            }

            if self.memory_exceeded() {
                break;
            }

            if !self.sanity_check().await? {
                break;
            }

            if self.state == WorkerState::Paused {
                sleep(interval).await;
                continue;
            }

            let queues = queue::resolve_queues(&mut self.store, &self.settings.queues).await?;
            if queues.is_empty() {
                sleep(interval).await;
                continue;
            }
            for queue_name in &queues {
                queue::promote_due(&mut self.store, queue_name).await?;
            }

            self.events.emit(&Event::WorkerWork {
                worker_id: self.id.clone(),
            });
            let claimed = queue::claim(
                &mut self.store,
                &self.events,
                &queues,
                self.settings.interval,
                self.settings.blocking,
                &self.id,
            )
            .await?;
            let Some(job) = claimed else {
                if !self.settings.blocking {
                    sleep(interval).await;
                }
                continue;
            };

            self.run_job(job).await?;
        }

        self.unregister().await?;
        if self.force_shutdown {
            self.events.emit(&Event::WorkerForceShutdown {
                worker_id: self.id.clone(),
            });
        } else {
            self.events.emit(&Event::WorkerShutdown {
                worker_id: self.id.clone(),
            });
        }
        tracing::info!(worker = %self.id, force = self.force_shutdown, "worker stopped");
        Ok(())
    }

    async fn register(&mut self) -> Result<()> {
        let now = Utc::now().timestamp();
        self.store.add_worker(&self.id).await?;
        self.store
            .save_worker_fields(
                &self.id,
                &[
                    ("host", self.host.name().to_string()),
                    ("pid", std::process::id().to_string()),
                    ("version", RUNTIME_VERSION.to_string()),
                    ("queues", self.settings.queues.join(",")),
                    ("status", WorkerState::Running.as_str().to_string()),
                    ("started", now.to_string()),
                    ("blocking", self.settings.blocking.to_string()),
                    ("interval", self.settings.interval.to_string()),
                    ("last_g_signal", String::new()),
                ],
            )
            .await?;
        let mut store = self.store.clone();
        self.host.register_worker(&mut store, &self.id).await?;
        self.events.emit(&Event::WorkerRegister {
            worker_id: self.id.clone(),
        });
        Ok(())
    }

    async fn unregister(&mut self) -> Result<()> {
        if let Err(err) = gc::cleanup_queues(&mut self.store, &self.id).await {
            tracing::warn!(error = %err, "queue cleanup failed during unregister");
        }
        let mut store = self.store.clone();
        self.host.unregister_worker(&mut store, &self.id).await?;
        self.store.remove_worker(&self.id).await?;
        self.events.emit(&Event::WorkerUnregister {
            worker_id: self.id.clone(),
        });
        Ok(())
    }

    /// Host and global recovery sweeps. The processing-list drain for this
    /// worker only runs on startup; on a cycle its own list legitimately
    /// holds nothing, and the prune covers dead peers.
    async fn run_cleanup(&mut self, scope: &str) -> Result<()> {
        gc::prune_workers(&mut self.store, self.host.name()).await?;
        let queues = self.store.known_queues().await?;
        gc::sweep_zombie_jobs(&mut self.store, &self.events, &queues).await?;
        if scope == "startup" {
            gc::cleanup_queues(&mut self.store, &self.id).await?;
        }
        gc::mark_orphan_worker_hashes(&mut self.store, self.host.name()).await?;
        gc::trim_archives(&mut self.store, &queues).await?;
        self.events.emit(&Event::WorkerCleanup {
            worker_id: self.id.clone(),
            scope: scope.to_string(),
        });
        Ok(())
    }

    /// Apply queued commands. When a child is running its pid is passed so
    /// cancel and force-shutdown reach it.
    async fn drain_commands(&mut self, child_pid: Option<u32>) {
        while let Ok(command) = self.commands_rx.try_recv() {
            self.apply_command(command, child_pid).await;
        }
    }

    async fn apply_command(&mut self, command: WorkerCommand, child_pid: Option<u32>) {
        match command {
            WorkerCommand::ForceShutdown => {
                self.force_shutdown = true;
                if let Some(pid) = child_pid {
                    self.events.emit(&Event::WorkerKillChild {
                        worker_id: self.id.clone(),
                        child_pid: pid,
                    });
                    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                }
                tracing::warn!(worker = %self.id, "force shutdown requested");
            }
            WorkerCommand::Shutdown => {
                self.shutdown = true;
                tracing::info!(worker = %self.id, "graceful shutdown requested");
            }
            WorkerCommand::CancelJob => {
                if let Some(pid) = child_pid {
                    tracing::info!(worker = %self.id, child = pid, "cancelling current job");
                    send_signal(pid, nix::sys::signal::Signal::SIGUSR1);
                }
            }
            WorkerCommand::Pause => {
                if self.state != WorkerState::Paused {
                    self.state = WorkerState::Paused;
                    self.save_state().await;
                    self.events.emit(&Event::WorkerPause {
                        worker_id: self.id.clone(),
                    });
                    tracing::info!(worker = %self.id, "paused");
                }
            }
            WorkerCommand::Resume => {
                if self.state == WorkerState::Paused {
                    self.state = WorkerState::Running;
                    self.save_state().await;
                    self.events.emit(&Event::WorkerResume {
                        worker_id: self.id.clone(),
                    });
                    tracing::info!(worker = %self.id, "resumed");
                }
            }
            WorkerCommand::Wakeup => {
                self.events.emit(&Event::WorkerWakeup {
                    worker_id: self.id.clone(),
                });
            }
            WorkerCommand::Reconnect => match Store::new(self.settings.clone()).await {
                Ok(store) => {
                    self.store = store;
                    tracing::info!(worker = %self.id, "reconnected to Redis");
                }
                Err(err) => {
                    tracing::error!(worker = %self.id, error = %err, "Redis reconnect failed");
                }
            },
        }
    }

    async fn save_state(&mut self) {
        if let Err(err) = self
            .store
            .save_worker_fields(&self.id, &[("status", self.state.as_str().to_string())])
            .await
        {
            tracing::warn!(error = %err, "failed to persist worker state");
        }
    }

    /// Poll the three remote-signal slots. The global slot is only applied
    /// when its value changes; the per-worker slot is delete-on-read. The
    /// per-job override slot is polled from the heartbeat while a child
    /// runs.
    async fn poll_remote_signals(&mut self) -> Result<()> {
        let global = self
            .store
            .global_field("signal")
            .await?
            .unwrap_or_default();
        if global != self.last_g_signal {
            if let Some(command) = parse_remote_signal(&global) {
                tracing::info!(worker = %self.id, signal = %global, "global remote signal");
                let _ = self.commands_tx.send(command);
            }
            self.last_g_signal = global;
        }

        if let Some(value) = self.store.take_worker_signal(&self.id).await? {
            match parse_remote_signal(&value) {
                Some(command) => {
                    tracing::info!(worker = %self.id, signal = %value, "remote signal");
                    let _ = self.commands_tx.send(command);
                }
                None => {
                    tracing::warn!(worker = %self.id, signal = %value, "unknown remote signal");
                }
            }
        }
        Ok(())
    }

    /// True while the cluster-wide dedicated gate names someone else and
    /// this worker honors it.
    async fn dedicated_gate_active(&mut self) -> Result<bool> {
        if !self.settings.dedicated_lock {
            return Ok(false);
        }
        let gated = match self.store.global_field("dedicated").await? {
            Some(dedicated) => dedicated != self.id,
            None => false,
        };
        if gated && !self.dedicated_gated {
            self.dedicated_gated = true;
            self.events.emit(&Event::WorkerPause {
                worker_id: self.id.clone(),
            });
            tracing::info!(worker = %self.id, "paused by dedicated gate");
        } else if !gated && self.dedicated_gated {
            self.dedicated_gated = false;
            self.events.emit(&Event::WorkerResume {
                worker_id: self.id.clone(),
            });
            tracing::info!(worker = %self.id, "dedicated gate cleared");
        }
        Ok(gated)
    }

    /// Memory watchdog: warn on each resident-memory decile crossed, shut
    /// down above 99.9% of the configured limit.
    fn memory_exceeded(&mut self) -> bool {
        if self.settings.memory_limit <= 0 {
            return false;
        }
        let used_mb = resident_memory_mb();
        let ratio = used_mb as f64 / self.settings.memory_limit as f64;
        let decile = (ratio * 10.0) as i64;
        if decile > self.last_memory_decile {
            tracing::warn!(
                worker = %self.id,
                used_mb,
                limit_mb = self.settings.memory_limit,
                "memory usage crossed {}0%",
                decile
            );
        }
        self.last_memory_decile = decile;
        if ratio > 0.999 {
            self.events.emit(&Event::WorkerLowMemory {
                worker_id: self.id.clone(),
                used_mb,
            });
            tracing::error!(worker = %self.id, used_mb, "memory limit exhausted; shutting down");
            return true;
        }
        false
    }

    /// A worker whose registration vanished underneath it must not keep
    /// claiming jobs.
    async fn sanity_check(&mut self) -> Result<bool> {
        let registered = self.store.is_worker(&self.id).await?;
        let packet = self.store.worker_map(&self.id).await?;
        if registered && !packet.is_empty() {
            return Ok(true);
        }
        self.events.emit(&Event::WorkerCorrupt {
            worker_id: self.id.clone(),
        });
        tracing::error!(worker = %self.id, registered, "worker registration corrupt; shutting down");
        Ok(false)
    }

    async fn run_job(&mut self, job: Job) -> Result<()> {
        self.events.emit(&Event::WorkerFork {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
        });

        let child = match self.spawn_child(&job) {
            Ok(child) => child,
            Err(err) => {
                self.events.emit(&Event::WorkerForkError {
                    worker_id: self.id.clone(),
                    job_id: job.id.clone(),
                    error: err.to_string(),
                });
                tracing::error!(job_id = %job.id, error = %err, "child spawn failed; re-queueing");
                self.return_unstarted(&job).await?;
                self.shutdown = true;
                return Ok(());
            }
        };
        let child_pid = child.id().unwrap_or(0);
        self.events.emit(&Event::WorkerForkParent {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
            child_pid,
        });
        self.events.emit(&Event::WorkerWorkingOn {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
        });
        self.store
            .save_worker_fields(
                &self.id,
                &[
                    ("job_id", job.id.clone()),
                    ("job_pid", child_pid.to_string()),
                    ("job_started", Utc::now().timestamp().to_string()),
                ],
            )
            .await?;

        let exit = self.wait_for_child(child, &job).await?;
        self.reconcile(&job, exit).await?;

        self.store
            .delete_worker_fields(&self.id, &["job_id", "job_pid", "job_load", "job_started"])
            .await?;
        self.events.emit(&Event::WorkerDoneWorking {
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
        });
        Ok(())
    }

    fn spawn_child(&self, job: &Job) -> Result<Child> {
        let exe = match &self.settings.worker_exec {
            Some(path) => PathBuf::from(path),
            None => std::env::current_exe().context("failed to resolve current executable")?,
        };
        let mut command = Command::new(exe);
        command
            .arg("exec-job")
            .arg(&job.id)
            .arg("--queue")
            .arg(&job.queue)
            .arg("--worker")
            .arg(&self.id);
        // Stdio stays inherited: the child's own capture pipeline handles
        // job output, and operator logs interleave in one place.
        command.kill_on_drop(true);
        command.spawn().context("failed to spawn job child process")
    }

    /// Poll the child to completion with periodic heartbeats, command
    /// handling, remote-override cancellation, and the hard wall cap.
    async fn wait_for_child(
        &mut self,
        mut child: Child,
        job: &Job,
    ) -> Result<std::process::ExitStatus> {
        let child_pid = child.id().unwrap_or(0);
        let wall_cap = Duration::from_secs(self.settings.job_wall_cap_seconds.max(1) as u64);
        let heartbeat_every =
            Duration::from_secs_f64(self.settings.heartbeat_interval_seconds.max(0.5));
        let deadline = Instant::now() + wall_cap;
        let mut last_beat = Instant::now();
        let mut cancel_sent = false;

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }

            while let Ok(command) = self.commands_rx.try_recv() {
                if command == WorkerCommand::CancelJob {
                    cancel_sent = true;
                }
                self.apply_command(command, Some(child_pid)).await;
            }
            if self.force_shutdown {
                let status = child.wait().await?;
                return Ok(status);
            }

            if Instant::now() >= deadline {
                tracing::error!(
                    job_id = %job.id,
                    child = child_pid,
                    cap_seconds = wall_cap.as_secs(),
                    "job exceeded the wall-clock cap; killing child"
                );
                self.events.emit(&Event::WorkerKillChild {
                    worker_id: self.id.clone(),
                    child_pid,
                });
                let _ = child.start_kill();
                let status = child.wait().await?;
                return Ok(status);
            }

            if last_beat.elapsed() >= heartbeat_every {
                self.heartbeat(child_pid).await;
                if !cancel_sent && self.override_cancelled(&job.id).await {
                    tracing::info!(job_id = %job.id, "override cancel observed; signalling child");
                    send_signal(child_pid, nix::sys::signal::Signal::SIGUSR1);
                    cancel_sent = true;
                }
                last_beat = Instant::now();
            }

            sleep(CHILD_POLL_SLEEP).await;
        }
    }

    async fn heartbeat(&mut self, child_pid: u32) {
        let memory = resident_memory_mb();
        let job_load = child_cpu_seconds(child_pid);
        let fields = [
            ("memory", memory.to_string()),
            ("job_load", format!("{job_load:.2}")),
            ("last_g_signal", self.last_g_signal.clone()),
        ];
        if let Err(err) = self.store.save_worker_fields(&self.id, &fields).await {
            tracing::warn!(error = %err, "heartbeat write failed");
        }
        let mut store = self.store.clone();
        if let Err(err) = self.host.keep_alive(&mut store).await {
            tracing::warn!(error = %err, "host keep-alive failed");
        }
        if let Err(err) = self.poll_remote_signals().await {
            tracing::warn!(error = %err, "remote signal poll failed");
        }
    }

    async fn override_cancelled(&mut self, job_id: &str) -> bool {
        match self.store.job_field(job_id, "override_status").await {
            Ok(Some(value)) => {
                value.parse::<i64>().ok().and_then(JobStatus::parse)
                    == Some(JobStatus::Cancelled)
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(error = %err, "override poll failed");
                false
            }
        }
    }

    /// After the child exits the job must be terminal. A job still RUNNING
    /// means the child died or lied; fail it as Dirty and shut down.
    async fn reconcile(&mut self, job: &Job, exit: std::process::ExitStatus) -> Result<()> {
        let current = self.store.load_job(&job.id).await?;
        let still_running = current
            .as_ref()
            .map(|job| job.status == JobStatus::Running)
            .unwrap_or(false);

        if still_running {
            let mut current = match current {
                Some(current) => current,
                None => job.clone(),
            };
            let error = format!(
                "Dirty: child exited with {} while the job was still running",
                exit_description(exit)
            );
            current
                .fail(&mut self.store, &self.events, &error, None)
                .await?;
            self.shutdown = true;
            tracing::error!(job_id = %job.id, exit = %exit_description(exit), "dirty child exit");
            return Ok(());
        }

        if !exit.success() {
            tracing::warn!(
                job_id = %job.id,
                exit = %exit_description(exit),
                "child exited non-zero after recording a terminal state"
            );
        }
        Ok(())
    }

    /// A claimed job whose child never started goes straight back to the
    /// waiting list.
    async fn return_unstarted(&mut self, job: &Job) -> Result<()> {
        let moved = self
            .store
            .requeue_direct(&job.queue, &self.id, &job.payload)
            .await?;
        if !moved {
            self.store.push_waiting(&job.queue, &job.payload).await?;
        }
        self.store.remove_running(&job.queue, &job.payload).await?;
        self.store
            .update_job_fields(
                &job.id,
                &[
                    ("status", JobStatus::Waiting.as_i64().to_string()),
                    ("worker", String::new()),
                ],
            )
            .await?;
        self.store.incr_stat(Some(&job.queue), "running", -1).await?;
        self.store.incr_stat(Some(&job.queue), "queued", 1).await?;
        Ok(())
    }

    #[cfg(unix)]
    fn install_signal_handlers(&self) {
        use tokio::signal::unix::{SignalKind, signal};
        let mappings = [
            (SignalKind::terminate(), WorkerCommand::ForceShutdown),
            (SignalKind::interrupt(), WorkerCommand::ForceShutdown),
            (SignalKind::quit(), WorkerCommand::Shutdown),
            (SignalKind::user_defined1(), WorkerCommand::CancelJob),
            (SignalKind::user_defined2(), WorkerCommand::Pause),
            (
                SignalKind::from_raw(nix::libc::SIGCONT),
                WorkerCommand::Resume,
            ),
            (SignalKind::pipe(), WorkerCommand::Reconnect),
        ];
        for (kind, command) in mappings {
            let tx = self.commands_tx.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            if tx.send(command).is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(signal = ?kind, error = %err, "failed to install signal handler");
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self) {}
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    if pid == 0 {
        return;
    }
    if let Err(err) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        tracing::warn!(pid, ?signal, error = %err, "failed to signal child");
    }
}

/// Resident memory of this process in MB, from procfs. Zero when the
/// platform offers no cheap probe.
#[cfg(target_os = "linux")]
fn resident_memory_mb() -> i64 {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return 0,
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: i64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> i64 {
    0
}

/// Cumulative CPU seconds of a child, sampled from its stat line.
#[cfg(target_os = "linux")]
fn child_cpu_seconds(pid: u32) -> f64 {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat,
        Err(_) => return 0.0,
    };
    // Skip past the parenthesized command name; fields count from there.
    let Some(after_comm) = stat.rsplit(')').next() else {
        return 0.0;
    };
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of the full line; the first two
    // and the comm were consumed, leaving them at offsets 11 and 12.
    let utime: f64 = fields.get(11).and_then(|f| f.parse().ok()).unwrap_or(0.0);
    let stime: f64 = fields.get(12).and_then(|f| f.parse().ok()).unwrap_or(0.0);
    (utime + stime) / 100.0
}

#[cfg(not(target_os = "linux"))]
fn child_cpu_seconds(_pid: u32) -> f64 {
    0.0
}

fn exit_description(exit: std::process::ExitStatus) -> String {
    match exit.code() {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    fn test_worker(ctx: &RedisTestContext) -> Worker {
        Worker::with_store(
            ctx.settings.clone(),
            ctx.store.clone(),
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn remote_signal_mapping() {
        assert_eq!(
            parse_remote_signal("FORCESHUTDOWN"),
            Some(WorkerCommand::ForceShutdown)
        );
        assert_eq!(parse_remote_signal("quit"), Some(WorkerCommand::Shutdown));
        assert_eq!(parse_remote_signal("CANCEL"), Some(WorkerCommand::CancelJob));
        assert_eq!(parse_remote_signal("PAUSE"), Some(WorkerCommand::Pause));
        assert_eq!(parse_remote_signal("RESUME"), Some(WorkerCommand::Resume));
        assert_eq!(parse_remote_signal("nonsense"), None);
    }

    #[tokio::test]
    async fn worker_id_has_host_pid_version_shape() {
        let ctx = RedisTestContext::new().await.unwrap();
        let worker = test_worker(&ctx);
        let mut parts = worker.id().rsplitn(3, ':');
        assert_eq!(parts.next(), Some(RUNTIME_VERSION));
        assert_eq!(
            parts.next().and_then(|pid| pid.parse::<u32>().ok()),
            Some(std::process::id())
        );
        assert!(!parts.next().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_and_sanity_check_round_trip() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut worker = test_worker(&ctx);

        worker.register().await.unwrap();
        assert!(ctx.store.is_worker(worker.id()).await.unwrap());
        assert!(worker.sanity_check().await.unwrap());
        let packet = ctx.store.worker_map(worker.id()).await.unwrap();
        assert_eq!(packet.get("status").map(String::as_str), Some("RUNNING"));
        assert_eq!(
            packet.get("pid").map(String::as_str),
            Some(std::process::id().to_string().as_str())
        );

        worker.unregister().await.unwrap();
        assert!(!ctx.store.is_worker(worker.id()).await.unwrap());
        assert!(!worker.sanity_check().await.unwrap());
    }

    #[tokio::test]
    async fn global_signal_applies_only_on_change() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut worker = test_worker(&ctx);

        ctx.store.set_global_field("signal", "PAUSE").await.unwrap();
        worker.poll_remote_signals().await.unwrap();
        worker.drain_commands(None).await;
        assert_eq!(worker.state, WorkerState::Paused);

        // Same value again: not re-applied.
        worker.state = WorkerState::Running;
        worker.poll_remote_signals().await.unwrap();
        worker.drain_commands(None).await;
        assert_eq!(worker.state, WorkerState::Running);

        ctx.store.set_global_field("signal", "RESUME").await.unwrap();
        worker.state = WorkerState::Paused;
        worker.poll_remote_signals().await.unwrap();
        worker.drain_commands(None).await;
        assert_eq!(worker.state, WorkerState::Running);
    }

    #[tokio::test]
    async fn per_worker_signal_is_consumed_once() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut worker = test_worker(&ctx);
        ctx.store
            .save_worker_fields(&worker.id.clone(), &[("signal", "QUIT".to_string())])
            .await
            .unwrap();

        worker.poll_remote_signals().await.unwrap();
        worker.drain_commands(None).await;
        assert!(worker.shutdown);

        worker.shutdown = false;
        worker.poll_remote_signals().await.unwrap();
        worker.drain_commands(None).await;
        assert!(!worker.shutdown);
    }

    #[tokio::test]
    async fn dedicated_gate_pauses_other_workers() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut worker = test_worker(&ctx);

        assert!(!worker.dedicated_gate_active().await.unwrap());

        set_dedicated(&mut ctx.store, "someone:1:0.0.0").await.unwrap();
        assert!(worker.dedicated_gate_active().await.unwrap());

        // The named worker itself is not gated.
        set_dedicated(&mut ctx.store, &worker.id.clone()).await.unwrap();
        assert!(!worker.dedicated_gate_active().await.unwrap());

        set_dedicated(&mut ctx.store, "someone:1:0.0.0").await.unwrap();
        assert!(worker.dedicated_gate_active().await.unwrap());
        remove_dedicated(&mut ctx.store).await.unwrap();
        assert!(!worker.dedicated_gate_active().await.unwrap());
        // The cluster token was bumped on removal.
        assert_eq!(
            ctx.store.global_field("cluster").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn dedicated_gate_is_ignored_without_the_lock_setting() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut settings = ctx.settings.clone();
        settings.dedicated_lock = false;
        let mut worker = Worker::with_store(settings, ctx.store.clone(), Arc::new(EventBus::new()));
        set_dedicated(&mut ctx.store, "someone:1:0.0.0").await.unwrap();
        assert!(!worker.dedicated_gate_active().await.unwrap());
    }

    #[tokio::test]
    async fn memory_watchdog_respects_disabled_limit() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut settings = ctx.settings.clone();
        settings.memory_limit = 0;
        let mut worker = Worker::with_store(settings, ctx.store.clone(), Arc::new(EventBus::new()));
        assert!(!worker.memory_exceeded());

        // A generous limit never trips either.
        worker.settings.memory_limit = i64::MAX / 2;
        assert!(!worker.memory_exceeded());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resident_memory_probe_reads_procfs() {
        assert!(resident_memory_mb() >= 0);
        // Our own process accrues some CPU time.
        assert!(child_cpu_seconds(std::process::id()) >= 0.0);
    }
}
