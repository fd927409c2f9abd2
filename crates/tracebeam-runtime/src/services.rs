// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tracebeam_capture::scheduled_task::ScheduledTask;
use tracebeam_capture::tasks::{self, StackSampler, TransactionStore};
use tracebeam_capture::transaction::Transaction;
use tracebeam_collect::aggregate::{AggregateCollector, AggregateStore};
use tracebeam_collect::clock::Clock;
use tracebeam_collect::gauge::{AttributeSourceRegistry, GaugeCollector, GaugeStore};

use crate::config::AgentConfig;
use crate::error::AgentError;

/// External collaborators the agent core depends on, injected by the host.
pub struct AgentDeps {
    pub transaction_store: Arc<dyn TransactionStore>,
    pub aggregate_store: Arc<dyn AggregateStore>,
    pub gauge_store: Arc<dyn GaugeStore>,
    pub attribute_registry: Arc<dyn AttributeSourceRegistry>,
    pub stack_sampler: Arc<dyn StackSampler>,
    pub clock: Arc<dyn Clock>,
}

/// Running agent core.
///
/// The instrumentation layer creates transactions through
/// [`Agent::begin_transaction`], schedules the background tasks it needs, and
/// hands completed transactions back through [`Agent::complete_transaction`].
pub struct Agent {
    config: AgentConfig,
    transaction_store: Arc<dyn TransactionStore>,
    stack_sampler: Arc<dyn StackSampler>,
    clock: Arc<dyn Clock>,
    aggregates: AggregateCollector,
    gauge_task: ScheduledTask,
}

impl Agent {
    /// Validates the configuration, spawns the aggregate flush worker and the
    /// recurring gauge poll, and returns the running agent.
    pub fn start(config: AgentConfig, deps: AgentDeps) -> Result<Agent, AgentError> {
        config.validate()?;

        let (aggregates, flush_worker) = AggregateCollector::new(
            Arc::clone(&deps.clock),
            config.aggregate_interval_millis,
            Arc::clone(&deps.aggregate_store),
        );
        tokio::spawn(flush_worker.run());

        let gauge_collector = Arc::new(GaugeCollector::new(
            config.gauge_sources.clone(),
            Arc::clone(&deps.attribute_registry),
            Arc::clone(&deps.gauge_store),
            Arc::clone(&deps.clock),
            Duration::from_secs(config.gauge_grace_window_secs),
        ));
        let poll = Duration::from_millis(config.gauge_poll_interval_millis);
        let gauge_task = ScheduledTask::spawn(gauge_collector, poll, Some(poll));

        debug!("agent core started");
        Ok(Agent {
            config,
            transaction_store: deps.transaction_store,
            stack_sampler: deps.stack_sampler,
            clock: deps.clock,
            aggregates,
            gauge_task,
        })
    }

    pub fn begin_transaction(
        &self,
        transaction_type: &str,
        transaction_name: &str,
        root_message: &str,
        start_tick: u64,
    ) -> Arc<Transaction> {
        Arc::new(Transaction::new(
            transaction_type,
            transaction_name,
            root_message,
            self.clock.now_millis(),
            start_tick,
            self.config.max_entries_per_transaction,
        ))
    }

    /// One-shot partial-store trigger. The transaction's threshold override
    /// takes precedence over the general store threshold when set.
    pub fn schedule_immediate_store(&self, transaction: &Arc<Transaction>) -> ScheduledTask {
        let threshold = transaction
            .store_threshold_override()
            .unwrap_or(self.config.store_threshold_millis);
        tasks::schedule_immediate_store(
            Arc::clone(transaction),
            Arc::clone(&self.transaction_store),
            Duration::from_millis(threshold),
        )
    }

    pub fn schedule_profiling_sampler(&self, transaction: &Arc<Transaction>) -> ScheduledTask {
        tasks::schedule_profiling_sampler(
            Arc::clone(transaction),
            Arc::clone(&self.stack_sampler),
            Duration::from_millis(self.config.profiling_interval_millis),
        )
    }

    pub fn schedule_outlier_sampler(&self, transaction: &Arc<Transaction>) -> ScheduledTask {
        tasks::schedule_outlier_sampler(
            Arc::clone(transaction),
            Arc::clone(&self.stack_sampler),
            Duration::from_millis(self.config.outlier_threshold_millis),
            Duration::from_millis(self.config.outlier_interval_millis),
        )
    }

    /// Rolls a completed transaction into the interval aggregates; returns
    /// the capture time it was attributed to. The caller is responsible for
    /// canceling any tasks it scheduled for the transaction.
    pub fn complete_transaction(&self, transaction: &Transaction) -> u64 {
        self.aggregates.add(transaction)
    }

    /// Stops the gauge poll and flushes any open aggregate bucket.
    pub async fn shutdown(self) {
        self.gauge_task.cancel();
        self.gauge_task.wait().await;
        self.aggregates.close().await;
        debug!("agent core stopped");
    }
}
