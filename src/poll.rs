//! Guarded periodic polling with bounded retries.
//!
//! Each named task runs while its guard predicate holds for the modem's
//! lifecycle state. A task body reports [`PollOutcome::Retry`] for transient
//! failures; a run of `max_retries` consecutive retries exhausts the task,
//! fires its exhaustion handler (which typically clears the datum being
//! polled), and parks it until the guard toggles off and on again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::modem::ModemState;

/// Static description of a periodic task.
#[derive(Debug, Clone, Copy)]
pub struct PollSpec {
    pub name: &'static str,
    pub interval: Duration,
    /// Consecutive retries before exhaustion. 0 = unbounded.
    pub max_retries: u32,
    /// Stop after the first success (one-shot semantics, e.g. timezone).
    pub once_on_success: bool,
}

/// What a poll body observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The datum was obtained (or the work is done for this tick).
    Done,
    /// Transient failure; try again next tick.
    Retry,
}

enum RunEnd {
    GuardOff,
    Success,
    Exhausted,
}

/// Periodic task set for one modem.
pub struct PollScheduler {
    state_rx: watch::Receiver<ModemState>,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl PollScheduler {
    #[must_use]
    pub fn new(state_rx: watch::Receiver<ModemState>, cancel: CancellationToken) -> Self {
        Self {
            state_rx,
            cancel,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or replace) a task. The body starts running once the guard
    /// first holds; see the module docs for the full lifecycle.
    pub fn register<G, F, Fut, E, EFut>(&self, spec: PollSpec, guard: G, body: F, on_exhausted: E)
    where
        G: Fn(ModemState) -> bool + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PollOutcome> + Send + 'static,
        E: Fn() -> EFut + Send + Sync + 'static,
        EFut: Future<Output = ()> + Send + 'static,
    {
        let mut state_rx = self.state_rx.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            loop {
                // Park until the guard holds.
                while !guard(*state_rx.borrow()) {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        res = state_rx.changed() => if res.is_err() { return; },
                    }
                }

                let mut retries: u32 = 0;
                let mut ticker = tokio::time::interval(spec.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let end = loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        res = state_rx.changed() => {
                            if res.is_err() { return; }
                            if !guard(*state_rx.borrow()) { break RunEnd::GuardOff; }
                        }
                        _ = ticker.tick() => match body().await {
                            PollOutcome::Done => {
                                if spec.once_on_success { break RunEnd::Success; }
                                retries = 0;
                            }
                            PollOutcome::Retry => {
                                retries += 1;
                                if spec.max_retries > 0 && retries >= spec.max_retries {
                                    debug!("poll {}: exhausted after {retries} retries", spec.name);
                                    on_exhausted().await;
                                    break RunEnd::Exhausted;
                                }
                            }
                        },
                    }
                };

                if matches!(end, RunEnd::Success | RunEnd::Exhausted) {
                    // Park until the guard drops, so the task re-arms only on
                    // the next false→true edge.
                    while guard(*state_rx.borrow()) {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            res = state_rx.changed() => if res.is_err() { return; },
                        }
                    }
                }
            }
        });

        if let Some(old) = self.tasks.lock().unwrap().insert(spec.name, handle) {
            old.abort();
        }
    }

    /// Stop and remove one task. Re-installed on the next `register`.
    pub fn stop(&self, name: &str) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(name) {
            handle.abort();
        }
    }

    /// Stop every task (modem teardown).
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn spec(max_retries: u32, once: bool) -> PollSpec {
        PollSpec {
            name: "test",
            interval: Duration::from_millis(5),
            max_retries,
            once_on_success: once,
        }
    }

    #[tokio::test]
    async fn test_retry_exhaustion_stops_polling() {
        let (tx, rx) = watch::channel(ModemState::Registered);
        let scheduler = PollScheduler::new(rx, CancellationToken::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicBool::new(false));

        let a = attempts.clone();
        let e = exhausted.clone();
        scheduler.register(
            spec(6, true),
            |s| s >= ModemState::Registered,
            move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    PollOutcome::Retry
                }
            },
            move || {
                let e = e.clone();
                async move {
                    e.store(true, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(exhausted.load(Ordering::SeqCst));
        drop(tx);
    }

    #[tokio::test]
    async fn test_guard_gates_execution() {
        let (tx, rx) = watch::channel(ModemState::Disabled);
        let scheduler = PollScheduler::new(rx, CancellationToken::new());
        let attempts = Arc::new(AtomicU32::new(0));

        let a = attempts.clone();
        scheduler.register(
            spec(0, false),
            |s| s >= ModemState::Registered,
            move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    PollOutcome::Done
                }
            },
            || async {},
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0, "guard is false");

        tx.send(ModemState::Registered).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 1);

        tx.send(ModemState::Searching).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frozen = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), frozen, "stopped with guard");
    }

    #[tokio::test]
    async fn test_once_on_success_rearms_on_edge() {
        let (tx, rx) = watch::channel(ModemState::Registered);
        let scheduler = PollScheduler::new(rx, CancellationToken::new());
        let attempts = Arc::new(AtomicU32::new(0));

        let a = attempts.clone();
        scheduler.register(
            spec(0, true),
            |s| s >= ModemState::Registered,
            move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    PollOutcome::Done
                }
            },
            || async {},
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "one-shot after success");

        // Guard off, then on again — the task runs once more.
        tx.send(ModemState::Enabled).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(ModemState::Registered).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
