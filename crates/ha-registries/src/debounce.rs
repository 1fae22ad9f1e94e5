//! Trailing-edge debouncer
//!
//! Coalesces bursts of calls into a single run of an async function after a
//! quiet period. Every call restarts the timer.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

type DebouncedFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Timer state shared with the spawned timer task
///
/// `timer` is only set while the task is still sleeping. The task takes it
/// back when it starts running, so a later call never aborts a run in
/// progress.
#[derive(Default)]
struct Slot {
    armed: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn rearm(&mut self) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.armed = true;
        self.generation
    }

    fn disarm(&mut self) -> bool {
        let pending = self.armed;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.armed = false;
        pending
    }

    /// Claim the run for the timer armed as `generation`
    fn claim(&mut self, generation: u64) -> bool {
        if !self.armed || self.generation != generation {
            return false;
        }
        self.armed = false;
        self.timer = None;
        true
    }
}

pub struct Debouncer {
    name: &'static str,
    cooldown: Duration,
    function: DebouncedFn,
    slot: Arc<Mutex<Slot>>,
}

impl Debouncer {
    pub fn new<F, Fut>(name: &'static str, cooldown: Duration, function: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            cooldown,
            function: Arc::new(move || function().boxed()),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Arm the timer, or restart it if already armed
    ///
    /// Outside a tokio runtime the run is deferred until `flush`.
    pub fn call(&self) {
        let mut slot = self.slot();
        let generation = slot.rearm();

        match Handle::try_current() {
            Ok(handle) => {
                let function = Arc::clone(&self.function);
                let shared = Arc::clone(&self.slot);
                let cooldown = self.cooldown;
                slot.timer = Some(handle.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    let claimed = shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .claim(generation);
                    if claimed {
                        function().await;
                    }
                }));
                trace!(debouncer = self.name, ?cooldown, "Debouncer armed");
            }
            Err(_) => {
                warn!(
                    debouncer = self.name,
                    "No async runtime available, run deferred until flush"
                );
            }
        }
    }

    /// Drop a pending run. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let cancelled = self.slot().disarm();
        if cancelled {
            trace!(debouncer = self.name, "Debouncer cancelled");
        }
        cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.slot().armed
    }

    /// Run a pending call now instead of waiting for the cooldown
    pub async fn flush(&self) {
        if self.cancel() {
            trace!(debouncer = self.name, "Debouncer flushed");
            (self.function)().await;
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.slot().disarm();
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("name", &self.name)
            .field("cooldown", &self.cooldown)
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(cooldown: Duration) -> (Debouncer, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let debouncer = Debouncer::new("test", cooldown, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (debouncer, runs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_once_after_quiet_period() {
        let (debouncer, runs) = counting(Duration::from_secs(10));

        debouncer.call();
        tokio::time::sleep(Duration::from_secs(5)).await;
        debouncer.call();
        tokio::time::sleep(Duration::from_secs(5)).await;
        debouncer.call();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_run() {
        let (debouncer, runs) = counting(Duration::from_secs(10));

        debouncer.call();
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_immediately() {
        let (debouncer, runs) = counting(Duration::from_secs(10));

        debouncer.flush().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        debouncer.call();
        debouncer.flush().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_during_run_lets_it_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let debouncer = Debouncer::new("slow", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        debouncer.call();
        // The first run starts at 10s and finishes at 15s
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!debouncer.is_pending());

        debouncer.call();
        assert!(debouncer.is_pending());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_run_lets_it_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let debouncer = Debouncer::new("slow", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        debouncer.call();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!debouncer.cancel());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_outside_runtime_defers_until_flush() {
        let (debouncer, runs) = counting(Duration::from_secs(10));

        debouncer.call();
        assert!(debouncer.is_pending());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(debouncer.flush());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }
}
