//! Background eviction of expired limiter state.
//!
//! The ticker is owned: [`Sweeper::start`] returns a [`SweeperHandle`], and the loop runs
//! until [`SweeperHandle::stop`] is awaited or the handle is dropped. There is no global
//! timer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::clock::Clock;

/// Something holding time-bounded state that can be evicted.
pub trait Sweep: Send + Sync {
    /// Remove everything expired at `now` (milliseconds); returns how many entries went.
    fn sweep(&self, now: u64) -> usize;
}

impl<T: Sweep + ?Sized> Sweep for Arc<T> {
    fn sweep(&self, now: u64) -> usize {
        (**self).sweep(now)
    }
}

/// Spawns sweep loops.
#[derive(Debug)]
pub struct Sweeper;

impl Sweeper {
    /// Call `target.sweep(clock.now_millis())` every `interval` on the current runtime.
    ///
    /// The first sweep happens one `interval` after start. Must be called from within a
    /// tokio runtime.
    pub fn start<T, C>(target: T, interval: Duration, clock: C) -> SweeperHandle
    where
        T: Sweep + 'static,
        C: Clock + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut total = 0_u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let removed = target.sweep(clock.now_millis());
                        total += removed as u64;
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired limiter state");
                        }
                    }
                }
            }
            tracing::debug!(total, "sweeper stopped");
            total
        });
        SweeperHandle { stop: Some(stop_tx), task: Some(task) }
    }
}

/// Owner of a running sweep loop. Dropping it aborts the loop.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<u64>>,
}

impl SweeperHandle {
    /// Stop the loop and wait for it to finish; returns the total entries swept.
    pub async fn stop(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Sweep for Counting {
        fn sweep(&self, _now: u64) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            2
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_each_tick_until_stopped() {
        let target = Arc::new(Counting::default());
        let handle = Sweeper::start(Arc::clone(&target), Duration::from_secs(1), ManualClock::starting_at(0));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);

        assert_eq!(handle.stop().await, 6);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_aborts() {
        let target = Arc::new(Counting::default());
        let handle = Sweeper::start(Arc::clone(&target), Duration::from_millis(100), ManualClock::starting_at(0));
        drop(handle);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }
}
