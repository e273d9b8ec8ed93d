//! Delayed and repeating task scheduling.
//!
//! Wraps tokio timers behind two small handle types so callers hold an
//! opaque cancellable token instead of a raw `JoinHandle`. Cancelling a
//! delay that has already fired is a no-op.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a one-shot delayed task.
pub struct DelayHandle {
    task: JoinHandle<()>,
}

impl DelayHandle {
    /// Best-effort cancellation. Safe to call after the delay has fired.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True once the body has run to completion or the delay was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs `body` once after `after` elapses, unless cancelled first.
pub fn delay<F>(after: Duration, body: F) -> DelayHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        tokio::time::sleep(after).await;
        body.await;
    });
    DelayHandle { task }
}

/// Handle to a repeating task.
pub struct RepeatHandle {
    task: JoinHandle<()>,
}

impl RepeatHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Runs `step` every `period`, starting immediately.
///
/// The step future is awaited inside the driving task, so two steps can
/// never overlap; a step that overruns the period causes the next tick to
/// be skipped rather than queued.
pub fn run_repeatedly<F, Fut>(period: Duration, mut step: F) -> RepeatHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            step().await;
        }
    });
    RepeatHandle { task }
}
