//! Cancellable timers.
//!
//! A [TimerSlot] owns at most one [ScheduledTask]; arming a slot cancels
//! whatever was armed before, so "one heartbeat / one pending reconnect" holds
//! by construction.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `fut` once after `delay` unless cancelled first.
    pub fn once<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        fut.await;
                    }
                }
            }
        });
        Self { cancel, handle }
    }

    /// Call `tick` every `period`, first call one period from now.
    pub fn repeating<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        });
        Self { cancel, handle }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Holder for a single timer.
#[derive(Default)]
pub struct TimerSlot {
    name: &'static str,
    task: Option<ScheduledTask>,
}

impl TimerSlot {
    pub fn new(name: &'static str) -> Self {
        Self { name, task: None }
    }

    /// Replace the armed timer, cancelling the previous one.
    pub fn arm(&mut self, task: ScheduledTask) {
        if let Some(old) = self.task.replace(task) {
            log::trace!("{} timer re-armed; cancelling previous", self.name);
            old.cancel();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(old) = self.task.take() {
            log::trace!("{} timer cancelled", self.name);
            old.cancel();
        }
    }

    /// A timer is armed and has neither fired to completion nor been cancelled.
    pub fn is_armed(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|t| !t.is_cancelled() && !t.is_finished())
    }
}
