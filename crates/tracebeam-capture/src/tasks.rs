// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::scheduled_task::{ScheduledTask, TaskAction, TaskOutcome};
use crate::transaction::{ProfileKind, Transaction};

/// Sink for transactions that exceed their store threshold while still
/// running. Implementations must not block; enqueue and return.
pub trait TransactionStore: Send + Sync {
    fn store_partial(&self, transaction: &Arc<Transaction>);
}

/// Samples the call stack of the thread owning a transaction.
pub trait StackSampler: Send + Sync {
    /// Frames ordered outermost first; `None` when the sampled thread is no
    /// longer alive.
    fn capture(&self) -> Option<Vec<String>>;
}

/// Fires once when the transaction exceeds its store threshold and forces a
/// partial store. Does nothing if the transaction has already completed.
pub struct ImmediateStoreAction {
    transaction: Arc<Transaction>,
    store: Arc<dyn TransactionStore>,
}

impl TaskAction for ImmediateStoreAction {
    fn execute(&self) -> anyhow::Result<TaskOutcome> {
        debug!("immediate store fired for transaction {}", self.transaction.id());
        if self.transaction.is_completed() {
            return Ok(TaskOutcome::Terminate);
        }
        self.transaction.set_partial();
        self.store.store_partial(&self.transaction);
        Ok(TaskOutcome::Terminate)
    }
}

/// Recurring stack-trace sampler feeding the main or outlier profile.
pub struct ProfileSamplerAction {
    transaction: Arc<Transaction>,
    sampler: Arc<dyn StackSampler>,
    kind: ProfileKind,
    previously_completed: AtomicBool,
}

impl TaskAction for ProfileSamplerAction {
    fn execute(&self) -> anyhow::Result<TaskOutcome> {
        if self.transaction.is_completed() {
            // one extra firing is allowed to cover the window between
            // completion and cancellation of this task; the second firing
            // that observes completion terminates the task
            if self.previously_completed.swap(true, Ordering::AcqRel) {
                return Ok(TaskOutcome::Terminate);
            }
            return Ok(TaskOutcome::Continue);
        }
        if let Some(frames) = self.sampler.capture() {
            self.transaction.add_stack_sample(self.kind, frames);
        }
        Ok(TaskOutcome::Continue)
    }
}

/// One-shot store trigger; the threshold delay is the timeout mechanism.
pub fn schedule_immediate_store(
    transaction: Arc<Transaction>,
    store: Arc<dyn TransactionStore>,
    threshold: Duration,
) -> ScheduledTask {
    ScheduledTask::spawn(
        Arc::new(ImmediateStoreAction { transaction, store }),
        threshold,
        None,
    )
}

/// Recurring sampler into the main profile, first firing one period in.
pub fn schedule_profiling_sampler(
    transaction: Arc<Transaction>,
    sampler: Arc<dyn StackSampler>,
    period: Duration,
) -> ScheduledTask {
    ScheduledTask::spawn(
        Arc::new(ProfileSamplerAction {
            transaction,
            sampler,
            kind: ProfileKind::Main,
            previously_completed: AtomicBool::new(false),
        }),
        period,
        Some(period),
    )
}

/// Recurring sampler into the outlier profile, armed only once the
/// transaction has outlived the outlier latency threshold.
pub fn schedule_outlier_sampler(
    transaction: Arc<Transaction>,
    sampler: Arc<dyn StackSampler>,
    threshold: Duration,
    period: Duration,
) -> ScheduledTask {
    ScheduledTask::spawn(
        Arc::new(ProfileSamplerAction {
            transaction,
            sampler,
            kind: ProfileKind::Outlier,
            previously_completed: AtomicBool::new(false),
        }),
        threshold,
        Some(period),
    )
}
