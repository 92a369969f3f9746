//! Periodic background tasks driving refill, cleanup and the idle check.

use futures::StreamExt;
use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, trace};

use crate::error::Result;

/// Delay before the first run of every periodic task.
pub(crate) const INITIAL_DELAY: Duration = Duration::from_millis(20);

/// Spawn `job` on `handle`, running it every `period` until `cancelled`
/// flips to `true`, its sender is dropped, `target` is dropped, or `job`
/// fails.
///
/// Runs use fixed-delay semantics: a slow run pushes the next one back
/// instead of triggering a burst of catch-up runs. A run that is already in
/// progress when cancellation arrives completes normally.
pub(crate) fn spawn_periodic<T, F>(
    handle: &Handle,
    name: &'static str,
    period: Duration,
    target: Weak<T>,
    mut cancelled: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Result<()> + Send + 'static,
{
    handle.spawn(async move {
        let mut interval = interval_at(Instant::now() + INITIAL_DELAY, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stop = async move {
            let _ = cancelled.wait_for(|stopped| *stopped).await;
        };
        let ticks = IntervalStream::new(interval).take_until(stop);
        tokio::pin!(ticks);

        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        while ticks.next().await.is_some() {
            let Some(target) = target.upgrade() else {
                break;
            };
            trace!(task = name, "Running periodic task");
            if let Err(e) = job(&target) {
                debug!(task = name, error = %e, "Periodic task ended");
                break;
            }
        }

        debug!(task = name, "Periodic task finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::error::LimiterError;

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_initial_delay_then_every_period() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (_cancel, cancelled) = watch::channel(false);

        let _task = spawn_periodic(
            &Handle::current(),
            "count",
            Duration::from_secs(1),
            Arc::downgrade(&counter),
            cancelled,
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (cancel, cancelled) = watch::channel(false);

        let task = spawn_periodic(
            &Handle::current(),
            "count",
            Duration::from_millis(100),
            Arc::downgrade(&counter),
            cancelled,
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.send(true).unwrap();
        task.await.unwrap();

        let runs = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_target_ends_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (_cancel, cancelled) = watch::channel(false);

        let task = spawn_periodic(
            &Handle::current(),
            "count",
            Duration::from_millis(100),
            Arc::downgrade(&counter),
            cancelled,
            |_: &AtomicUsize| Ok(()),
        );

        drop(counter);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task should exit once its target is gone")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_ends_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (_cancel, cancelled) = watch::channel(false);

        let task = spawn_periodic(
            &Handle::current(),
            "fail",
            Duration::from_millis(100),
            Arc::downgrade(&counter),
            cancelled,
            |c: &AtomicUsize| {
                c.fetch_add(1, Ordering::SeqCst);
                Err(LimiterError::LimiterStopped)
            },
        );

        task.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
