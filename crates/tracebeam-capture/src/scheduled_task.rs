// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Result of one task firing. Termination is signalled as a value rather than
/// through the error channel, so action errors stay purely diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    Terminate,
}

/// Body of a scheduled task. Errors are logged by the runner and never stop a
/// recurring task; return [`TaskOutcome::Terminate`] to stop it.
pub trait TaskAction: Send + Sync + 'static {
    fn execute(&self) -> anyhow::Result<TaskOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Scheduled = 0,
    Running = 1,
    Rescheduled = 2,
    Canceled = 3,
    Terminated = 4,
}

fn task_state(value: u8) -> TaskState {
    match value {
        0 => TaskState::Scheduled,
        1 => TaskState::Running,
        2 => TaskState::Rescheduled,
        3 => TaskState::Canceled,
        _ => TaskState::Terminated,
    }
}

/// Cancellable one-shot or recurring background action running on the shared
/// runtime.
#[derive(Debug)]
pub struct ScheduledTask {
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawns the task; `period` of `None` makes it one-shot.
    pub fn spawn(
        action: Arc<dyn TaskAction>,
        initial_delay: Duration,
        period: Option<Duration>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(TaskState::Scheduled as u8));
        let join = tokio::spawn(run_task(
            action,
            initial_delay,
            period,
            cancel.clone(),
            Arc::clone(&state),
        ));
        ScheduledTask {
            cancel,
            state,
            join,
        }
    }

    pub fn state(&self) -> TaskState {
        task_state(self.state.load(Ordering::Acquire))
    }

    /// Idempotent; prevents any further firing, including ones already due.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task body to exit, after cancellation or termination.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

async fn run_task(
    action: Arc<dyn TaskAction>,
    initial_delay: Duration,
    period: Option<Duration>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
) {
    let mut delay = initial_delay;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                state.store(TaskState::Canceled as u8, Ordering::Release);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        // a cancellation racing the sleep expiry must still win
        if cancel.is_cancelled() {
            state.store(TaskState::Canceled as u8, Ordering::Release);
            return;
        }
        state.store(TaskState::Running as u8, Ordering::Release);
        match action.execute() {
            Ok(TaskOutcome::Continue) => {}
            Ok(TaskOutcome::Terminate) => {
                state.store(TaskState::Terminated as u8, Ordering::Release);
                return;
            }
            Err(e) => warn!("scheduled task failed: {e:#}"),
        }
        match period {
            Some(p) => {
                state.store(TaskState::Rescheduled as u8, Ordering::Release);
                delay = p;
            }
            None => {
                state.store(TaskState::Terminated as u8, Ordering::Release);
                return;
            }
        }
    }
}
