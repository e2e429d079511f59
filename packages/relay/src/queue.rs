use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Metadata for the run currently holding a session key.
#[derive(Debug)]
pub struct ActiveRun {
    pub request_id: String,
    pub is_priority: bool,
    pub sender: Option<String>,
    kill: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct QueueMaps {
    /// Per-key queue tail: the done-flag of the most recently enqueued run,
    /// tagged with its ticket so only the final node clears the slot.
    tails: HashMap<String, (u64, watch::Receiver<bool>)>,
    active: HashMap<String, ActiveRun>,
    next_ticket: u64,
}

/// Per-session-key serialization: at most one running child per key, FIFO
/// ordering, explicit preemption for regenerate, nothing implicit.
///
/// Cheap to clone; all clones share the same tables. Map mutations happen
/// under one short-lived lock that is never held across an await, so two
/// near-simultaneous requests for the same key are guaranteed to serialize.
#[derive(Debug, Clone, Default)]
pub struct SessionQueues {
    inner: Arc<Mutex<QueueMaps>>,
}

impl SessionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register on the tail for `key`. The returned slot must be awaited
    /// before spawning; it releases its place when dropped.
    pub fn join(&self, key: &str) -> QueueSlot {
        let (done_tx, done_rx) = watch::channel(false);
        let mut maps = self.inner.lock().expect("queue lock");
        maps.next_ticket += 1;
        let ticket = maps.next_ticket;
        let prev = maps
            .tails
            .insert(key.to_string(), (ticket, done_rx))
            .map(|(_, rx)| rx);
        QueueSlot {
            key: key.to_string(),
            ticket,
            prev,
            done: Some(done_tx),
            queues: self.clone(),
        }
    }

    /// Install the active run for `key`. Returns the run's kill signal and a
    /// guard that clears the slot when dropped, so a handler future dropped
    /// mid-run cannot leak the entry.
    pub fn begin_run(
        &self,
        key: &str,
        request_id: &str,
        is_priority: bool,
        sender: Option<String>,
    ) -> (RunGuard, watch::Receiver<bool>) {
        let (kill_tx, kill_rx) = watch::channel(false);
        let mut maps = self.inner.lock().expect("queue lock");
        maps.active.insert(
            key.to_string(),
            ActiveRun {
                request_id: request_id.to_string(),
                is_priority,
                sender,
                kill: kill_tx,
            },
        );
        let guard = RunGuard {
            queues: self.clone(),
            key: key.to_string(),
            request_id: request_id.to_string(),
        };
        (guard, kill_rx)
    }

    /// Clear the active-run slot, but only if it still belongs to
    /// `request_id` (a preempting run may already have replaced it).
    fn end_run(&self, key: &str, request_id: &str) {
        let mut maps = self.inner.lock().expect("queue lock");
        if maps
            .active
            .get(key)
            .map(|run| run.request_id == request_id)
            .unwrap_or(false)
        {
            maps.active.remove(key);
        }
    }

    /// Signal the active run for `key` to terminate. Returns true if a run
    /// was signalled.
    pub fn preempt(&self, key: &str) -> bool {
        let maps = self.inner.lock().expect("queue lock");
        match maps.active.get(key) {
            Some(run) => {
                tracing::debug!(
                    request_id = %run.request_id,
                    priority = run.is_priority,
                    sender = ?run.sender,
                    "preempting active run"
                );
                let _ = run.kill.send(true);
                true
            }
            None => false,
        }
    }

    /// Signal every active run. Used on graceful shutdown.
    pub fn preempt_all(&self) -> usize {
        let maps = self.inner.lock().expect("queue lock");
        for run in maps.active.values() {
            let _ = run.kill.send(true);
        }
        maps.active.len()
    }

    pub fn has_active(&self, key: &str) -> bool {
        self.inner.lock().expect("queue lock").active.contains_key(key)
    }

    pub fn has_tail(&self, key: &str) -> bool {
        self.inner.lock().expect("queue lock").tails.contains_key(key)
    }

    fn release(&self, key: &str, ticket: u64) {
        let mut maps = self.inner.lock().expect("queue lock");
        if maps
            .tails
            .get(key)
            .map(|(tail_ticket, _)| *tail_ticket == ticket)
            .unwrap_or(false)
        {
            maps.tails.remove(key);
        }
    }
}

/// Clears the active-run slot on drop.
pub struct RunGuard {
    queues: SessionQueues,
    key: String,
    request_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.queues.end_run(&self.key, &self.request_id);
    }
}

/// A place in a session's queue. Await [`QueueSlot::wait`] to become the
/// head; the slot resolves its done-flag and clears the tail (if it still is
/// the tail) on drop, so a cancelled request can never deadlock the queue.
pub struct QueueSlot {
    key: String,
    ticket: u64,
    prev: Option<watch::Receiver<bool>>,
    done: Option<watch::Sender<bool>>,
    queues: SessionQueues,
}

impl QueueSlot {
    /// Wait until every earlier run for this key has finished.
    pub async fn wait(&mut self) {
        if let Some(prev) = self.prev.as_mut() {
            loop {
                if *prev.borrow() {
                    break;
                }
                // A dropped sender also means the previous run is gone.
                if prev.changed().await.is_err() {
                    break;
                }
            }
            self.prev = None;
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let done = self.done.take();
        if let Some(mut prev) = self.prev.take() {
            // Dropped before reaching the head (cancelled while queued).
            // Resolving now would let a successor overlap the still-active
            // head, so the chain is handed to a detached task that resolves
            // in order.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let queues = self.queues.clone();
                let key = std::mem::take(&mut self.key);
                let ticket = self.ticket;
                handle.spawn(async move {
                    loop {
                        if *prev.borrow() {
                            break;
                        }
                        if prev.changed().await.is_err() {
                            break;
                        }
                    }
                    if let Some(done) = done {
                        let _ = done.send(true);
                    }
                    queues.release(&key, ticket);
                });
                return;
            }
        }
        if let Some(done) = done {
            let _ = done.send(true);
        }
        self.queues.release(&self.key, self.ticket);
    }
}
