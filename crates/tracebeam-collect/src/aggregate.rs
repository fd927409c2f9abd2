// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fnv::FnvBuildHasher;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use tracebeam_capture::transaction::Transaction;

use crate::clock::Clock;

// fnv's FnvHashMap alias sits behind its std feature, which stays off
type FnvMap<K, V> = HashMap<K, V, FnvBuildHasher>;

/// Running sums for one (type[, name]) grouping within a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateTotals {
    pub total_nanos: u64,
    pub transaction_count: u64,
    pub error_count: u64,
}

impl AggregateTotals {
    fn merge(&mut self, duration_nanos: u64, is_error: bool) {
        self.total_nanos += duration_nanos;
        self.transaction_count += 1;
        if is_error {
            self.error_count += 1;
        }
    }
}

/// One flushed aggregate row. `transaction_name` is `None` for the overall
/// (per-type) summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub transaction_type: String,
    pub transaction_name: Option<String>,
    pub capture_time_millis: u64,
    pub totals: AggregateTotals,
}

/// Flush callback, invoked exactly once per sealed bucket, in seal order.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn store(&self, overall: Vec<Aggregate>, by_name: Vec<Aggregate>);
}

#[derive(Debug)]
struct Bucket {
    capture_time_millis: u64,
    overall: FnvMap<String, AggregateTotals>,
    by_name: FnvMap<(String, String), AggregateTotals>,
}

impl Bucket {
    fn new(capture_time_millis: u64) -> Self {
        Bucket {
            capture_time_millis,
            overall: FnvMap::default(),
            by_name: FnvMap::default(),
        }
    }

    fn merge(
        &mut self,
        transaction_type: &str,
        transaction_name: &str,
        duration_nanos: u64,
        is_error: bool,
    ) {
        self.overall
            .entry(transaction_type.to_string())
            .or_default()
            .merge(duration_nanos, is_error);
        self.by_name
            .entry((transaction_type.to_string(), transaction_name.to_string()))
            .or_default()
            .merge(duration_nanos, is_error);
    }

    fn into_aggregates(self) -> (Vec<Aggregate>, Vec<Aggregate>) {
        let capture_time_millis = self.capture_time_millis;
        let mut overall = self
            .overall
            .into_iter()
            .map(|(transaction_type, totals)| Aggregate {
                transaction_type,
                transaction_name: None,
                capture_time_millis,
                totals,
            })
            .collect::<Vec<_>>();
        overall.sort_by(|a, b| a.transaction_type.cmp(&b.transaction_type));
        let mut by_name = self
            .by_name
            .into_iter()
            .map(|((transaction_type, transaction_name), totals)| Aggregate {
                transaction_type,
                transaction_name: Some(transaction_name),
                capture_time_millis,
                totals,
            })
            .collect::<Vec<_>>();
        by_name.sort_by(|a, b| {
            (&a.transaction_type, &a.transaction_name)
                .cmp(&(&b.transaction_type, &b.transaction_name))
        });
        (overall, by_name)
    }
}

#[derive(Debug)]
enum FlushCommand {
    Seal(Bucket),
    Shutdown(oneshot::Sender<()>),
}

/// Single task draining sealed buckets, serializing writes to the store.
pub struct FlushWorker {
    rx: mpsc::UnboundedReceiver<FlushCommand>,
    store: Arc<dyn AggregateStore>,
}

impl FlushWorker {
    pub async fn run(mut self) {
        debug!("aggregate flush worker started");
        while let Some(command) = self.rx.recv().await {
            match command {
                FlushCommand::Seal(bucket) => {
                    let capture_time = bucket.capture_time_millis;
                    let (overall, by_name) = bucket.into_aggregates();
                    debug!(
                        "flushing aggregate bucket at {capture_time} ({} overall, {} by name)",
                        overall.len(),
                        by_name.len()
                    );
                    self.store.store(overall, by_name).await;
                }
                FlushCommand::Shutdown(ack) => {
                    if ack.send(()).is_err() {
                        error!("failed to acknowledge flush worker shutdown - receiver dropped");
                    }
                    break;
                }
            }
        }
        debug!("aggregate flush worker stopped");
    }
}

/// Buckets completed transactions into fixed-interval aggregates.
///
/// Exactly one bucket is open at a time; `add` is safe for concurrent callers
/// and seals/reopens atomically when the capture time crosses an interval
/// boundary. Sealed buckets are flushed exactly once, asynchronously, in seal
/// order.
pub struct AggregateCollector {
    interval_millis: u64,
    clock: Arc<dyn Clock>,
    open: Mutex<Option<Bucket>>,
    tx: mpsc::UnboundedSender<FlushCommand>,
}

impl AggregateCollector {
    /// The returned worker must be spawned; it owns the store side.
    pub fn new(
        clock: Arc<dyn Clock>,
        interval_millis: u64,
        store: Arc<dyn AggregateStore>,
    ) -> (Self, FlushWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = AggregateCollector {
            interval_millis,
            clock,
            open: Mutex::new(None),
            tx,
        };
        (collector, FlushWorker { rx, store })
    }

    /// Merges a completed transaction into the bucket covering now, sealing
    /// the previous bucket first when an interval boundary has been crossed.
    /// Returns the capture time the transaction was attributed to.
    pub fn add(&self, transaction: &Transaction) -> u64 {
        let now = self.clock.now_millis();
        let capture_time = now.div_ceil(self.interval_millis) * self.interval_millis;
        let duration_nanos = transaction.duration_nanos().unwrap_or(0);
        let is_error = transaction.error().is_some();
        let transaction_type = transaction.transaction_type().to_string();
        let transaction_name = transaction.transaction_name().to_string();

        #[allow(clippy::expect_used)]
        let mut open = self.open.lock().expect("lock poisoned");
        match open.as_mut() {
            // `<=` also absorbs a wall clock running backwards
            Some(bucket) if capture_time <= bucket.capture_time_millis => {
                bucket.merge(&transaction_type, &transaction_name, duration_nanos, is_error);
            }
            _ => {
                if let Some(sealed) = open.take() {
                    self.seal(sealed);
                }
                let mut bucket = Bucket::new(capture_time);
                bucket.merge(&transaction_type, &transaction_name, duration_nanos, is_error);
                *open = Some(bucket);
            }
        }
        capture_time
    }

    /// Flushes any still-open bucket and stops the worker. Returns once the
    /// worker has drained every previously sealed bucket.
    pub async fn close(&self) {
        let sealed = {
            #[allow(clippy::expect_used)]
            let mut open = self.open.lock().expect("lock poisoned");
            open.take()
        };
        if let Some(bucket) = sealed {
            self.seal(bucket);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(FlushCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn seal(&self, bucket: Bucket) {
        if self.tx.send(FlushCommand::Seal(bucket)).is_err() {
            error!("failed to enqueue sealed aggregate bucket - flush worker stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct RecordingStore {
        flushes: Mutex<Vec<(Vec<Aggregate>, Vec<Aggregate>)>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            RecordingStore {
                flushes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AggregateStore for RecordingStore {
        async fn store(&self, overall: Vec<Aggregate>, by_name: Vec<Aggregate>) {
            self.flushes.lock().unwrap().push((overall, by_name));
        }
    }

    fn completed_transaction(ttype: &str, tname: &str, duration_nanos: u64) -> Transaction {
        let tx = Transaction::new(ttype, tname, "root", 0, 0, 100);
        tx.pop_entry(tx.root_entry(), duration_nanos, None);
        tx
    }

    fn failed_transaction(ttype: &str, tname: &str, duration_nanos: u64) -> Transaction {
        let tx = completed_transaction(ttype, tname, duration_nanos);
        tx.set_error("boom");
        tx
    }

    #[tokio::test]
    async fn bucket_alignment_and_single_flush() {
        let clock = Arc::new(ManualClock::new(1_450));
        let store = Arc::new(RecordingStore::new());
        let (collector, worker) =
            AggregateCollector::new(Arc::clone(&clock) as _, 1_000, Arc::clone(&store) as _);
        let worker_task = tokio::spawn(worker.run());

        let tx1 = completed_transaction("Web", "/a", 100);
        assert_eq!(collector.add(&tx1), 2_000);

        clock.set(1_900);
        let tx2 = completed_transaction("Web", "/a", 50);
        assert_eq!(collector.add(&tx2), 2_000);

        clock.set(2_100);
        let tx3 = completed_transaction("Web", "/a", 25);
        assert_eq!(collector.add(&tx3), 3_000);

        collector.close().await;
        worker_task.await.unwrap();

        let flushes = store.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);

        let (overall, by_name) = &flushes[0];
        assert_eq!(overall.len(), 1);
        assert_eq!(overall[0].capture_time_millis, 2_000);
        assert_eq!(overall[0].totals.total_nanos, 150);
        assert_eq!(overall[0].totals.transaction_count, 2);
        assert_eq!(by_name[0].transaction_name.as_deref(), Some("/a"));

        let (overall, _) = &flushes[1];
        assert_eq!(overall[0].capture_time_millis, 3_000);
        assert_eq!(overall[0].totals.total_nanos, 25);
    }

    #[tokio::test]
    async fn overall_and_by_name_groupings() {
        let clock = Arc::new(ManualClock::new(500));
        let store = Arc::new(RecordingStore::new());
        let (collector, worker) =
            AggregateCollector::new(Arc::clone(&clock) as _, 1_000, Arc::clone(&store) as _);
        let worker_task = tokio::spawn(worker.run());

        collector.add(&completed_transaction("Web", "/a", 10));
        collector.add(&completed_transaction("Web", "/b", 20));
        collector.add(&failed_transaction("Background", "job", 30));

        collector.close().await;
        worker_task.await.unwrap();

        let flushes = store.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        let (overall, by_name) = &flushes[0];

        assert_eq!(overall.len(), 2);
        assert_eq!(overall[0].transaction_type, "Background");
        assert_eq!(overall[0].totals.error_count, 1);
        assert_eq!(overall[1].transaction_type, "Web");
        assert_eq!(overall[1].totals.total_nanos, 30);
        assert_eq!(overall[1].totals.transaction_count, 2);

        assert_eq!(by_name.len(), 3);
        assert_eq!(by_name[1].transaction_name.as_deref(), Some("/a"));
        assert_eq!(by_name[2].transaction_name.as_deref(), Some("/b"));
    }

    #[tokio::test]
    async fn close_without_data_stores_nothing() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(RecordingStore::new());
        let (collector, worker) =
            AggregateCollector::new(clock as _, 1_000, Arc::clone(&store) as _);
        let worker_task = tokio::spawn(worker.run());

        collector.close().await;
        worker_task.await.unwrap();
        assert!(store.flushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exact_boundary_stays_in_its_bucket() {
        let clock = Arc::new(ManualClock::new(2_000));
        let store = Arc::new(RecordingStore::new());
        let (collector, worker) =
            AggregateCollector::new(Arc::clone(&clock) as _, 1_000, Arc::clone(&store) as _);
        let worker_task = tokio::spawn(worker.run());

        assert_eq!(collector.add(&completed_transaction("Web", "/a", 1)), 2_000);
        clock.set(2_001);
        assert_eq!(collector.add(&completed_transaction("Web", "/a", 1)), 3_000);

        collector.close().await;
        worker_task.await.unwrap();
        assert_eq!(store.flushes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_adds_never_lose_transactions() {
        let clock = Arc::new(ManualClock::new(100));
        let store = Arc::new(RecordingStore::new());
        let (collector, worker) =
            AggregateCollector::new(Arc::clone(&clock) as _, 1_000, Arc::clone(&store) as _);
        let worker_task = tokio::spawn(worker.run());
        let collector = Arc::new(collector);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let collector = Arc::clone(&collector);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    collector.add(&completed_transaction("Web", "/a", 1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        collector.close().await;
        worker_task.await.unwrap();

        let flushes = store.flushes.lock().unwrap();
        let total: u64 = flushes
            .iter()
            .flat_map(|(overall, _)| overall.iter())
            .map(|a| a.totals.transaction_count)
            .sum();
        assert_eq!(total, 200);
    }
}
