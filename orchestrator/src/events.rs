//! Process-local event bus. The bus is constructed by the embedding program
//! and handed to the core at startup; nothing in the core reaches for a
//! global. Listeners run synchronously on the emitting task, and a listener
//! returning `false` from a vetoable event cancels the action.

use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub enum Event {
    JobInstance {
        job_id: String,
        queue: String,
        class: String,
    },
    JobQueue {
        job_id: String,
        queue: String,
    },
    JobQueued {
        job_id: String,
        queue: String,
    },
    JobDelay {
        job_id: String,
        queue: String,
        run_at: i64,
    },
    JobDelayed {
        job_id: String,
        queue: String,
        run_at: i64,
    },
    JobQueueDelayed {
        job_id: String,
        queue: String,
        run_at: i64,
    },
    JobQueuedDelayed {
        job_id: String,
        queue: String,
        run_at: i64,
    },
    JobPerform {
        job_id: String,
        class: String,
    },
    JobPerforming {
        job_id: String,
        class: String,
    },
    JobRunning {
        job_id: String,
        worker_id: String,
    },
    JobComplete {
        job_id: String,
    },
    JobCancelled {
        job_id: String,
        reason: String,
    },
    JobFailure {
        job_id: String,
        error: String,
    },
    JobDone {
        job_id: String,
    },
    WorkerInstance {
        worker_id: String,
    },
    WorkerStartup {
        worker_id: String,
    },
    WorkerRegister {
        worker_id: String,
    },
    WorkerUnregister {
        worker_id: String,
    },
    WorkerWork {
        worker_id: String,
    },
    WorkerFork {
        worker_id: String,
        job_id: String,
    },
    WorkerForkParent {
        worker_id: String,
        job_id: String,
        child_pid: u32,
    },
    WorkerForkChild {
        worker_id: String,
        job_id: String,
    },
    WorkerForkError {
        worker_id: String,
        job_id: String,
        error: String,
    },
    WorkerWorkingOn {
        worker_id: String,
        job_id: String,
    },
    WorkerDoneWorking {
        worker_id: String,
        job_id: String,
    },
    WorkerKillChild {
        worker_id: String,
        child_pid: u32,
    },
    WorkerPause {
        worker_id: String,
    },
    WorkerResume {
        worker_id: String,
    },
    WorkerWakeup {
        worker_id: String,
    },
    WorkerShutdown {
        worker_id: String,
    },
    WorkerForceShutdown {
        worker_id: String,
    },
    WorkerCleanup {
        worker_id: String,
        scope: String,
    },
    WorkerLowMemory {
        worker_id: String,
        used_mb: i64,
    },
    WorkerCorrupt {
        worker_id: String,
    },
}

impl Event {
    /// Only these four action events honor a `false` return from a listener.
    pub fn is_vetoable(&self) -> bool {
        matches!(
            self,
            Event::JobQueue { .. }
                | Event::JobDelay { .. }
                | Event::JobPerform { .. }
                | Event::JobQueueDelayed { .. }
        )
    }
}

pub trait EventListener: Send + Sync {
    /// Return `false` to veto a vetoable event. The return value of
    /// non-vetoable events is ignored.
    fn on_event(&self, event: &Event) -> bool;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn on_event(&self, event: &Event) -> bool {
        self(event)
    }
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Fan the event out to every listener. Returns `false` iff the event is
    /// vetoable and at least one listener vetoed it; all listeners are
    /// invoked either way.
    pub fn emit(&self, event: &Event) -> bool {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners,
            Err(_) => return true,
        };
        let mut allowed = true;
        for listener in listeners.iter() {
            if !listener.on_event(event) && event.is_vetoable() {
                allowed = false;
            }
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn veto_only_applies_to_vetoable_events() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(|event: &Event| {
            !matches!(event, Event::JobQueue { .. })
        }));

        assert!(!bus.emit(&Event::JobQueue {
            job_id: "j".into(),
            queue: "q".into(),
        }));
        assert!(bus.emit(&Event::JobQueued {
            job_id: "j".into(),
            queue: "q".into(),
        }));
    }

    #[test]
    fn all_listeners_run_even_after_a_veto() {
        let bus = EventBus::new();
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        bus.subscribe(Arc::new(|_: &Event| false));
        bus.subscribe(Arc::new(|_: &Event| {
            SEEN.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let allowed = bus.emit(&Event::JobPerform {
            job_id: "j".into(),
            class: "Echo".into(),
        });
        assert!(!allowed);
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);
    }
}
