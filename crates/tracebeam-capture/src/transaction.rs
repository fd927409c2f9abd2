// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use hashbrown::HashMap;

use crate::entry_stack::{EntryHandle, TraceEntry, TraceEntryStack};
use crate::profile::Profile;
use crate::timer_tree::{TimerHandle, TimerSnapshot, TimerTree};

/// Sentinel meaning the general store threshold applies.
pub const USE_GENERAL_STORE_THRESHOLD: i64 = -1;

static NEXT_TRANSACTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Which profile a sampled stack belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Main,
    Outlier,
}

// entries and timers share one lock since they are always mutated together,
// and only ever by the owning thread (the lock is uncontended on the hot path)
#[derive(Debug)]
struct CaptureState {
    entries: TraceEntryStack,
    timers: TimerTree,
}

/// All data captured for one traced unit of work (e.g. one request).
///
/// Only one thread mutates the entries and timers, but multiple threads can
/// read the transaction while it is being updated. Readers go through the
/// snapshot accessors, which observe the visibility flag the owning thread
/// sets after every mutation; the very latest in-flight update may not be
/// visible yet, a deliberate trade against synchronizing every field write.
/// Metadata setters are safe from any thread.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    start_time_millis: u64,
    start_tick: u64,

    transaction_type: String,
    transaction_name: String,
    // first explicit non-empty write wins
    type_override: OnceLock<String>,
    name_override: OnceLock<String>,

    user: OnceLock<String>,
    // transaction-level error, preferred over the root entry's error
    error: OnceLock<String>,

    // the only locked metadata structure, since any thread may add attributes
    custom_attributes: Mutex<HashMap<String, BTreeSet<String>>>,

    store_threshold_override: AtomicI64,

    capture: Mutex<CaptureState>,

    profile: OnceLock<Mutex<Profile>>,
    outlier_profile: OnceLock<Mutex<Profile>>,

    partial: AtomicBool,
    completed: AtomicBool,
    visibility: AtomicBool,
}

impl Transaction {
    pub fn new(
        transaction_type: &str,
        transaction_name: &str,
        root_message: &str,
        start_time_millis: u64,
        start_tick: u64,
        max_entries: usize,
    ) -> Self {
        let seq = NEXT_TRANSACTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let (timers, root_timer) = TimerTree::new(transaction_type, start_tick);
        let entries = TraceEntryStack::new(
            start_tick,
            root_message.to_string(),
            Some(root_timer),
            max_entries,
        );
        Transaction {
            id: format!("{start_time_millis:x}-{seq:x}"),
            start_time_millis,
            start_tick,
            transaction_type: transaction_type.to_string(),
            transaction_name: transaction_name.to_string(),
            type_override: OnceLock::new(),
            name_override: OnceLock::new(),
            user: OnceLock::new(),
            error: OnceLock::new(),
            custom_attributes: Mutex::new(HashMap::new()),
            store_threshold_override: AtomicI64::new(USE_GENERAL_STORE_THRESHOLD),
            capture: Mutex::new(CaptureState { entries, timers }),
            profile: OnceLock::new(),
            outlier_profile: OnceLock::new(),
            partial: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            visibility: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// Handle that pops the root entry, completing the transaction.
    pub fn root_entry(&self) -> EntryHandle {
        EntryHandle::root()
    }

    // ---- owning-thread capture operations ----

    pub fn push_entry(
        &self,
        start_tick: u64,
        message: impl Into<String>,
        timer: Option<TimerHandle>,
    ) -> EntryHandle {
        let handle = self
            .capture_state()
            .entries
            .push(start_tick, message.into(), timer);
        self.mark_mutated();
        handle
    }

    /// Ends the entry and stops any timers linked to entries popped along the
    /// way (including ones closed by a defensive unwind).
    pub fn pop_entry(&self, handle: EntryHandle, end_tick: u64, error: Option<String>) {
        let completed = {
            let mut capture = self.capture_state();
            let closed_timers = capture.entries.pop(handle, end_tick, error);
            for timer in closed_timers {
                capture.timers.stop(timer, end_tick);
            }
            capture.entries.is_completed()
        };
        if completed {
            self.completed.store(true, Ordering::Release);
        }
        self.mark_mutated();
    }

    pub fn add_point_entry(
        &self,
        start_tick: u64,
        end_tick: u64,
        message: impl Into<String>,
        error: Option<String>,
    ) {
        self.capture_state()
            .entries
            .add_point_entry(start_tick, end_tick, message.into(), error);
        self.mark_mutated();
    }

    pub fn start_timer(&self, name: &str, start_tick: u64) -> TimerHandle {
        let handle = self.capture_state().timers.start(name, start_tick);
        self.mark_mutated();
        handle
    }

    pub fn stop_timer(&self, handle: TimerHandle, end_tick: u64) {
        self.capture_state().timers.stop(handle, end_tick);
        self.mark_mutated();
    }

    // ---- metadata, safe from any thread ----

    /// First explicit non-empty write wins; later writes are ignored.
    pub fn set_transaction_type(&self, transaction_type: &str) {
        if !transaction_type.is_empty() {
            let _ = self.type_override.set(transaction_type.to_string());
        }
    }

    pub fn set_transaction_name(&self, transaction_name: &str) {
        if !transaction_name.is_empty() {
            let _ = self.name_override.set(transaction_name.to_string());
        }
    }

    pub fn set_user(&self, user: &str) {
        if !user.is_empty() {
            let _ = self.user.set(user.to_string());
        }
    }

    pub fn set_error(&self, error: &str) {
        if !error.is_empty() {
            let _ = self.error.set(error.to_string());
        }
    }

    pub fn put_custom_attribute(&self, name: &str, value: &str) {
        #[allow(clippy::expect_used)]
        let mut attributes = self.custom_attributes.lock().expect("lock poisoned");
        attributes
            .entry_ref(name)
            .or_default()
            .insert(value.to_string());
    }

    /// First call sets the override; later calls keep the minimum, so the most
    /// aggressive threshold always wins.
    pub fn set_store_threshold_override(&self, threshold_millis: i64) {
        let _ = self
            .store_threshold_override
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == USE_GENERAL_STORE_THRESHOLD {
                    Some(threshold_millis)
                } else {
                    Some(current.min(threshold_millis))
                }
            });
    }

    pub fn set_partial(&self) {
        self.partial.store(true, Ordering::Release);
    }

    // ---- read accessors ----

    pub fn transaction_type(&self) -> &str {
        self.type_override
            .get()
            .map(String::as_str)
            .unwrap_or(&self.transaction_type)
    }

    pub fn transaction_name(&self) -> &str {
        self.name_override
            .get()
            .map(String::as_str)
            .unwrap_or(&self.transaction_name)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.get().map(String::as_str)
    }

    /// Prefers the transaction-level error over the root entry's error, which
    /// tends to be a more generic message.
    pub fn error(&self) -> Option<String> {
        if let Some(error) = self.error.get() {
            return Some(error.clone());
        }
        self.read_visibility();
        self.capture_state().entries.root_error()
    }

    pub fn custom_attributes(&self) -> BTreeMap<String, BTreeSet<String>> {
        #[allow(clippy::expect_used)]
        let attributes = self.custom_attributes.lock().expect("lock poisoned");
        attributes
            .iter()
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect()
    }

    /// None while the general store threshold applies.
    pub fn store_threshold_override(&self) -> Option<u64> {
        let value = self.store_threshold_override.load(Ordering::Acquire);
        if value == USE_GENERAL_STORE_THRESHOLD {
            None
        } else {
            Some(value.max(0) as u64)
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Duration in nanoseconds, available once the root entry has popped.
    pub fn duration_nanos(&self) -> Option<u64> {
        self.read_visibility();
        self.capture_state().entries.duration()
    }

    pub fn entry_count(&self) -> usize {
        self.read_visibility();
        self.capture_state().entries.entry_count()
    }

    /// Number of entries implicitly ended by defensive unwinds.
    pub fn unwind_count(&self) -> u64 {
        self.read_visibility();
        self.capture_state().entries.unwind_count()
    }

    pub fn entries_snapshot(&self) -> Vec<TraceEntry> {
        self.read_visibility();
        self.capture_state().entries.entries()
    }

    pub fn timer_snapshot(&self) -> TimerSnapshot {
        self.read_visibility();
        self.capture_state().timers.snapshot()
    }

    // ---- profiling ----

    /// Merges one sampled stack into the selected profile, creating it on
    /// first use. Samples arriving after completion are dropped; this guards
    /// the window between completion and sampler cancellation.
    pub fn add_stack_sample(&self, kind: ProfileKind, frames: Vec<String>) {
        if self.is_completed() {
            return;
        }
        let profile = match kind {
            ProfileKind::Main => &self.profile,
            ProfileKind::Outlier => &self.outlier_profile,
        };
        #[allow(clippy::expect_used)]
        profile
            .get_or_init(|| Mutex::new(Profile::new()))
            .lock()
            .expect("lock poisoned")
            .add_stack(&frames);
    }

    pub fn is_profiled(&self) -> bool {
        self.profile.get().is_some()
    }

    pub fn profile_snapshot(&self, kind: ProfileKind) -> Option<Profile> {
        let profile = match kind {
            ProfileKind::Main => &self.profile,
            ProfileKind::Outlier => &self.outlier_profile,
        };
        #[allow(clippy::expect_used)]
        let snapshot = profile
            .get()
            .map(|p| p.lock().expect("lock poisoned").clone());
        snapshot
    }

    // ---- visibility ----

    fn capture_state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        #[allow(clippy::expect_used)]
        let guard = self.capture.lock().expect("lock poisoned");
        guard
    }

    fn mark_mutated(&self) {
        self.visibility.store(true, Ordering::Release);
    }

    fn read_visibility(&self) -> bool {
        self.visibility.load(Ordering::Acquire)
    }
}
