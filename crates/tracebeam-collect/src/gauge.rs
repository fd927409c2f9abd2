// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use tracebeam_capture::scheduled_task::{TaskAction, TaskOutcome};

use crate::clock::Clock;

/// One successfully polled numeric reading. All samples from one poll share
/// the same capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub source_name: String,
    pub attribute: String,
    pub capture_time_millis: u64,
    pub value: f64,
}

/// One configured gauge source: an external identifier plus the attributes to
/// read from it. `version` changes whenever the configuration is edited, so
/// warning dedup restarts for the new revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeSourceConfig {
    pub name: String,
    pub source_id: String,
    pub attributes: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    NonNumeric,
}

#[derive(Debug, thiserror::Error)]
pub enum AttributeReadError {
    #[error("source not found")]
    SourceNotFound,
    #[error("attribute not found")]
    AttributeNotFound,
    #[error("{0}")]
    ReadFailed(String),
}

/// Opaque external attribute source (e.g. a management endpoint).
pub trait AttributeSourceRegistry: Send + Sync {
    fn read_attribute(
        &self,
        source_id: &str,
        attribute: &str,
    ) -> Result<AttributeValue, AttributeReadError>;
}

/// Sink for one poll's batch of samples.
pub trait GaugeStore: Send + Sync {
    fn store(&self, samples: Vec<GaugeSample>);
}

/// Polls configured sources on a fixed period.
///
/// A failing source or attribute never prevents collection of the rest of the
/// poll. Warnings are deduplicated per source version: "source not found" is
/// suppressed during the startup grace window (sources often register late),
/// then logged once; attribute-level failures are logged once per
/// (source version, attribute).
pub struct GaugeCollector {
    sources: Vec<GaugeSourceConfig>,
    registry: Arc<dyn AttributeSourceRegistry>,
    store: Arc<dyn GaugeStore>,
    clock: Arc<dyn Clock>,
    start_time_millis: u64,
    grace_window_millis: u64,
    pending_logged: Mutex<HashSet<String>>,
    logged: Mutex<HashSet<String>>,
}

impl GaugeCollector {
    pub fn new(
        sources: Vec<GaugeSourceConfig>,
        registry: Arc<dyn AttributeSourceRegistry>,
        store: Arc<dyn GaugeStore>,
        clock: Arc<dyn Clock>,
        grace_window: Duration,
    ) -> Self {
        let start_time_millis = clock.now_millis();
        GaugeCollector {
            sources,
            registry,
            store,
            clock,
            start_time_millis,
            grace_window_millis: grace_window.as_millis() as u64,
            pending_logged: Mutex::new(HashSet::new()),
            logged: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one poll and stores the batch.
    pub fn collect(&self) {
        let capture_time_millis = self.clock.now_millis();
        let mut samples = Vec::new();
        for source in &self.sources {
            for attribute in &source.attributes {
                match self.registry.read_attribute(&source.source_id, attribute) {
                    Ok(AttributeValue::Number(value)) => samples.push(GaugeSample {
                        source_name: source.name.clone(),
                        attribute: attribute.clone(),
                        capture_time_millis,
                        value,
                    }),
                    Ok(AttributeValue::NonNumeric) => {
                        self.log_attribute_error(
                            source,
                            attribute,
                            "attribute value is not a number",
                        );
                    }
                    Err(AttributeReadError::SourceNotFound) => {
                        // the remaining attributes of this source would give
                        // the same error
                        self.log_source_not_found(source);
                        break;
                    }
                    Err(AttributeReadError::AttributeNotFound) => {
                        self.log_attribute_not_found(source, attribute);
                    }
                    Err(AttributeReadError::ReadFailed(message)) => {
                        self.log_attribute_error(source, attribute, &message);
                    }
                }
            }
        }
        debug!("gauge poll captured {} samples", samples.len());
        self.store.store(samples);
    }

    // relatively common during startup, so the first post-grace warning
    // explains the wait
    fn log_source_not_found(&self, source: &GaugeSourceConfig) {
        #[allow(clippy::expect_used)]
        let mut pending = self.pending_logged.lock().expect("lock poisoned");
        // saturate: the wall clock can step backwards past collector start
        let elapsed = self
            .clock
            .now_millis()
            .saturating_sub(self.start_time_millis);
        if elapsed < self.grace_window_millis {
            pending.insert(source.version.clone());
            return;
        }
        #[allow(clippy::expect_used)]
        let mut logged = self.logged.lock().expect("lock poisoned");
        if logged.insert(source.version.clone()) {
            if pending.remove(&source.version) {
                warn!(
                    "gauge source not found: {} (waited {} seconds after agent startup before \
                     logging this warning to allow time for source registration)",
                    source.source_id,
                    self.grace_window_millis / 1000
                );
            } else {
                warn!("gauge source not found: {}", source.source_id);
            }
        }
    }

    fn log_attribute_not_found(&self, source: &GaugeSourceConfig, attribute: &str) {
        if self.mark_logged(format!("{}/{attribute}", source.version)) {
            warn!(
                "gauge attribute {} not found: {}",
                attribute, source.source_id
            );
        }
    }

    fn log_attribute_error(&self, source: &GaugeSourceConfig, attribute: &str, message: &str) {
        if self.mark_logged(format!("{}/{attribute}", source.version)) {
            warn!(
                "error reading gauge attribute {} {}: {}",
                source.source_id, attribute, message
            );
        }
    }

    fn mark_logged(&self, key: String) -> bool {
        #[allow(clippy::expect_used)]
        let mut logged = self.logged.lock().expect("lock poisoned");
        logged.insert(key)
    }
}

impl TaskAction for GaugeCollector {
    fn execute(&self) -> anyhow::Result<TaskOutcome> {
        self.collect();
        Ok(TaskOutcome::Continue)
    }
}
