//! Keyed one-shot timers with explicit cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

struct ArmedTimer {
    seq: u64,
    abort: AbortHandle,
}

#[derive(Clone, Default)]
pub struct TimerRegistry {
    timers: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    next_seq: Arc<AtomicU64>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
        lock(&self.timers)
    }

    /// Run `callback` at `deadline` unless cancelled first. Re-arming an id
    /// replaces its previous timer.
    pub fn arm<F>(&self, id: impl Into<String>, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = id.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        // Hold the map while spawning so the timer cannot fire before it is registered.
        let mut timers = self.timers();
        let registry = self.timers.clone();
        let timer_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let still_armed = {
                let mut timers = lock(&registry);
                match timers.get(&timer_id) {
                    Some(t) if t.seq == seq => {
                        timers.remove(&timer_id);
                        true
                    }
                    _ => false,
                }
            };
            if still_armed {
                debug!("Timer {} fired", timer_id);
                callback();
            }
        });

        if let Some(previous) = timers.insert(
            id,
            ArmedTimer {
                seq,
                abort: task.abort_handle(),
            },
        ) {
            previous.abort.abort();
        }
    }

    /// Returns false if nothing was armed under `id` (including already fired).
    pub fn cancel(&self, id: &str) -> bool {
        match self.timers().remove(id) {
            Some(timer) => {
                timer.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel everything; returns how many timers were still armed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ArmedTimer> = self.timers().drain().map(|(_, t)| t).collect();
        for timer in &drained {
            timer.abort.abort();
        }
        drained.len()
    }

    pub fn armed(&self) -> usize {
        self.timers().len()
    }
}

fn lock(timers: &Mutex<HashMap<String, ArmedTimer>>) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}
