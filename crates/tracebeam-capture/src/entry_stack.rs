// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use tracing::warn;

use crate::timer_tree::TimerHandle;

const LIMIT_EXCEEDED_MESSAGE: &str = "trace entry limit exceeded, remaining entries omitted";

/// Handle to a pushed trace entry, consumed by [`TraceEntryStack::pop`].
///
/// Pushes past the entry limit return an inert handle: no entry is recorded,
/// but the handle still carries the caller's timer so popping it closes the
/// timer normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    index: Option<usize>,
    timer: Option<TimerHandle>,
}

impl EntryHandle {
    fn inert(timer: Option<TimerHandle>) -> Self {
        EntryHandle { index: None, timer }
    }

    // the root entry always occupies slot zero
    pub(crate) fn root() -> Self {
        EntryHandle {
            index: Some(0),
            timer: None,
        }
    }

    pub fn is_inert(&self) -> bool {
        self.index.is_none()
    }
}

/// One captured nested operation. Entries are stored in creation order; the
/// call tree is implied by `depth` rather than parent pointers, since readers
/// only need a linear sequence plus nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub depth: usize,
    pub start_tick: u64,
    pub end_tick: Option<u64>,
    pub message: String,
    pub error: Option<String>,
    pub timer: Option<TimerHandle>,
    pub limit_exceeded_marker: bool,
}

/// Push/pop stack of trace entries forming a call tree, capped at a maximum
/// entry count. Mutated only by the thread that owns the transaction.
#[derive(Debug)]
pub struct TraceEntryStack {
    entries: Vec<TraceEntry>,
    // indices of entries that have been pushed but not yet popped
    active: Vec<usize>,
    max_entries: usize,
    limit_marker_added: bool,
    unwind_count: u64,
    completed: bool,
}

impl TraceEntryStack {
    pub fn new(
        start_tick: u64,
        message: String,
        timer: Option<TimerHandle>,
        max_entries: usize,
    ) -> Self {
        let root = TraceEntry {
            depth: 0,
            start_tick,
            end_tick: None,
            message,
            error: None,
            timer,
            limit_exceeded_marker: false,
        };
        TraceEntryStack {
            entries: vec![root],
            active: vec![0],
            max_entries,
            limit_marker_added: false,
            unwind_count: 0,
            completed: false,
        }
    }

    /// Creates a child of the current top and makes it current.
    pub fn push(
        &mut self,
        start_tick: u64,
        message: String,
        timer: Option<TimerHandle>,
    ) -> EntryHandle {
        if self.entries.len() >= self.max_entries {
            self.add_limit_marker_if_needed(start_tick);
            return EntryHandle::inert(timer);
        }
        let index = self.entries.len();
        self.entries.push(TraceEntry {
            depth: self.active.len(),
            start_tick,
            end_tick: None,
            message,
            error: None,
            timer,
            limit_exceeded_marker: false,
        });
        self.active.push(index);
        EntryHandle {
            index: Some(index),
            timer: None,
        }
    }

    /// Ends the handle's entry and restores its parent as current.
    ///
    /// If the handle is not the current top (a missed pop upstream), entries
    /// are unwound down to it and implicitly ended at the same `end_tick`.
    /// That leniency masks a caller bug, so each unwound entry is counted and
    /// logged rather than failing the whole transaction.
    ///
    /// Returns the linked timer handles of every entry actually popped,
    /// innermost first, so the owner can close the matching timers.
    pub fn pop(
        &mut self,
        handle: EntryHandle,
        end_tick: u64,
        error: Option<String>,
    ) -> Vec<TimerHandle> {
        let Some(target) = handle.index else {
            // limit-bypassed entry: no entry to end, but its timer still must
            // stop
            return handle.timer.into_iter().collect();
        };
        if !self.active.contains(&target) {
            // double pop or a handle from another transaction; unwinding here
            // would end entries (the root included) that are still running
            warn!("popped trace entry was not on the stack");
            self.unwind_count += 1;
            return Vec::new();
        }
        let mut closed_timers = Vec::new();
        while let Some(top) = self.active.pop() {
            let entry = &mut self.entries[top];
            entry.end_tick = Some(end_tick);
            if let Some(timer) = entry.timer {
                closed_timers.push(timer);
            }
            if top == target {
                entry.error = error;
                break;
            }
            self.unwind_count += 1;
            warn!("unwinding trace entry that was never popped");
        }
        if self.active.is_empty() {
            self.completed = true;
        }
        closed_timers
    }

    /// Appends an already-ended entry at the current depth without altering
    /// the current top, for operations fully computed elsewhere.
    pub fn add_point_entry(
        &mut self,
        start_tick: u64,
        end_tick: u64,
        message: String,
        error: Option<String>,
    ) {
        if self.entries.len() >= self.max_entries {
            self.add_limit_marker_if_needed(start_tick);
            return;
        }
        self.entries.push(TraceEntry {
            depth: self.active.len(),
            start_tick,
            end_tick: Some(end_tick),
            message,
            error,
            timer: None,
            limit_exceeded_marker: false,
        });
    }

    fn add_limit_marker_if_needed(&mut self, tick: u64) {
        if self.limit_marker_added {
            return;
        }
        self.limit_marker_added = true;
        self.entries.push(TraceEntry {
            depth: self.active.len(),
            start_tick: tick,
            end_tick: Some(tick),
            message: LIMIT_EXCEEDED_MESSAGE.to_string(),
            error: None,
            timer: None,
            limit_exceeded_marker: true,
        });
    }

    /// True once the root entry has been popped.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Root end tick minus root start tick, only available after completion.
    pub fn duration(&self) -> Option<u64> {
        if !self.completed {
            return None;
        }
        let root = &self.entries[0];
        root.end_tick.map(|end| end.saturating_sub(root.start_tick))
    }

    pub fn root_error(&self) -> Option<String> {
        self.entries[0].error.clone()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries that were implicitly ended by a defensive unwind;
    /// nonzero values indicate a caller protocol violation somewhere upstream.
    pub fn unwind_count(&self) -> u64 {
        self.unwind_count
    }

    /// Point-in-time immutable copy of all entries for readers.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(max_entries: usize) -> TraceEntryStack {
        TraceEntryStack::new(0, "root".to_string(), None, max_entries)
    }

    #[test]
    fn matched_push_pop_yields_balanced_tree() {
        let mut s = stack(100);
        let a = s.push(10, "a".to_string(), None);
        let b = s.push(20, "b".to_string(), None);
        s.pop(b, 30, None);
        s.pop(a, 40, None);
        assert!(!s.is_completed());

        s.pop(EntryHandle::root(), 50, None);
        assert!(s.is_completed());
        assert_eq!(s.duration(), Some(50));

        let entries = s.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].depth, 1);
        assert_eq!(entries[2].depth, 2);
        for entry in &entries {
            assert!(entry.end_tick.unwrap() >= entry.start_tick);
        }
        assert_eq!(s.unwind_count(), 0);
    }

    #[test]
    fn duration_unavailable_before_root_pop() {
        let mut s = stack(100);
        let a = s.push(10, "a".to_string(), None);
        assert_eq!(s.duration(), None);
        s.pop(a, 20, None);
        assert_eq!(s.duration(), None);
    }

    #[test]
    fn mismatched_pop_unwinds_intermediates() {
        let mut s = stack(100);
        let a = s.push(10, "a".to_string(), None);
        let _b = s.push(20, "b".to_string(), None);
        let _c = s.push(30, "c".to_string(), None);

        s.pop(a, 40, None);

        let entries = s.entries();
        // b and c were implicitly ended at a's end tick
        assert_eq!(entries[2].end_tick, Some(40));
        assert_eq!(entries[3].end_tick, Some(40));
        assert_eq!(s.unwind_count(), 2);
        assert!(!s.is_completed());
    }

    #[test]
    fn entry_limit_appends_single_marker() {
        // root plus two pushes fills the limit
        let mut s = stack(3);
        let a = s.push(1, "a".to_string(), None);
        let b = s.push(2, "b".to_string(), None);

        let c = s.push(3, "c".to_string(), None);
        assert!(c.is_inert());
        s.add_point_entry(4, 5, "d".to_string(), None);
        let e = s.push(6, "e".to_string(), None);
        assert!(e.is_inert());

        let entries = s.entries();
        assert_eq!(entries.len(), 4);
        let markers: Vec<_> = entries.iter().filter(|e| e.limit_exceeded_marker).collect();
        assert_eq!(markers.len(), 1);

        // inert pops do not disturb the stack
        s.pop(c, 7, None);
        s.pop(b, 8, None);
        s.pop(a, 9, None);
        assert_eq!(s.unwind_count(), 0);
    }

    #[test]
    fn point_entry_does_not_alter_current() {
        let mut s = stack(100);
        let a = s.push(10, "a".to_string(), None);
        s.add_point_entry(11, 12, "point".to_string(), Some("boom".to_string()));
        let b = s.push(13, "b".to_string(), None);
        s.pop(b, 14, None);
        s.pop(a, 15, None);

        let entries = s.entries();
        assert_eq!(entries[2].message, "point");
        assert_eq!(entries[2].depth, 2);
        assert_eq!(entries[2].error.as_deref(), Some("boom"));
        assert_eq!(entries[3].depth, 2);
        assert_eq!(s.unwind_count(), 0);
    }

    #[test]
    fn inert_pop_returns_the_carried_timer() {
        let (mut tree, _root) = crate::timer_tree::TimerTree::new("root", 0);
        let timer = tree.start("jdbc query", 5);

        let mut s = stack(1);
        let inert = s.push(5, "dropped".to_string(), Some(timer));
        assert!(inert.is_inert());

        let closed = s.pop(inert, 30, None);
        assert_eq!(closed, vec![timer]);
        assert!(!s.is_completed());
        assert_eq!(s.unwind_count(), 0);
    }

    #[test]
    fn double_pop_does_not_complete_the_stack() {
        let mut s = stack(100);
        let a = s.push(10, "a".to_string(), None);
        s.pop(a, 20, None);

        // stale handle: nothing on the stack may be ended by it
        let closed = s.pop(a, 30, None);
        assert!(closed.is_empty());
        assert!(!s.is_completed());
        assert_eq!(s.duration(), None);
        assert_eq!(s.unwind_count(), 1);
        assert_eq!(s.entries()[1].end_tick, Some(20));

        s.pop(EntryHandle::root(), 40, None);
        assert!(s.is_completed());
        assert_eq!(s.duration(), Some(40));
    }

    #[test]
    fn pop_records_error_on_target_only() {
        let mut s = stack(100);
        let a = s.push(10, "a".to_string(), None);
        let _b = s.push(20, "b".to_string(), None);
        s.pop(a, 30, Some("failed".to_string()));

        let entries = s.entries();
        assert_eq!(entries[1].error.as_deref(), Some("failed"));
        assert_eq!(entries[2].error, None);
    }
}
