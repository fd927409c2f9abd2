// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashMap;
use tracing::warn;
use ustr::Ustr;

/// Handle to a started timer, returned by [`TimerTree::start`] and consumed by
/// [`TimerTree::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    node: usize,
    start_tick: u64,
}

#[derive(Debug)]
struct TimerNode {
    name: Ustr,
    parent: Option<usize>,
    total_nanos: u64,
    count: u64,
    children: HashMap<Ustr, usize>,
}

/// Tree of nested named timers, mutated only by the thread that owns the
/// transaction. Exactly one timer is current at any instant; starting a name
/// that already exists under the current timer merges into that child.
#[derive(Debug)]
pub struct TimerTree {
    nodes: Vec<TimerNode>,
    current: usize,
}

/// Point-in-time owned copy of the timer tree for cross-thread readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub name: String,
    pub total_nanos: u64,
    pub count: u64,
    pub children: Vec<TimerSnapshot>,
}

impl TimerTree {
    /// Creates the tree with an active root timer and returns the handle that
    /// stops it.
    pub fn new(root_name: &str, start_tick: u64) -> (Self, TimerHandle) {
        let root = TimerNode {
            name: Ustr::from(root_name),
            parent: None,
            total_nanos: 0,
            count: 1,
            children: HashMap::new(),
        };
        let tree = TimerTree {
            nodes: vec![root],
            current: 0,
        };
        let handle = TimerHandle {
            node: 0,
            start_tick,
        };
        (tree, handle)
    }

    pub fn start(&mut self, name: &str, start_tick: u64) -> TimerHandle {
        let name = Ustr::from(name);
        let node = match self.nodes[self.current].children.get(&name) {
            Some(&existing) => {
                self.nodes[existing].count += 1;
                existing
            }
            None => {
                let node = self.nodes.len();
                self.nodes.push(TimerNode {
                    name,
                    parent: Some(self.current),
                    total_nanos: 0,
                    count: 1,
                    children: HashMap::new(),
                });
                self.nodes[self.current].children.insert(name, node);
                node
            }
        };
        self.current = node;
        TimerHandle { node, start_tick }
    }

    /// Adds the elapsed time to the handle's node and restores the parent as
    /// the current timer. A handle that is not current indicates a missed stop
    /// upstream; the tree is walked up to it so later stops stay consistent.
    pub fn stop(&mut self, handle: TimerHandle, end_tick: u64) {
        if self.current != handle.node {
            warn!(
                "stopped timer {} is not the current timer",
                self.nodes[handle.node].name
            );
            while self.current != handle.node {
                match self.nodes[self.current].parent {
                    Some(parent) => self.current = parent,
                    None => break,
                }
            }
        }
        let node = &mut self.nodes[handle.node];
        node.total_nanos += end_tick.saturating_sub(handle.start_tick);
        self.current = node.parent.unwrap_or(handle.node);
    }

    /// Name of the current timer.
    pub fn current_name(&self) -> &str {
        &self.nodes[self.current].name
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        self.snapshot_node(0)
    }

    fn snapshot_node(&self, index: usize) -> TimerSnapshot {
        let node = &self.nodes[index];
        let mut children = node
            .children
            .values()
            .map(|&child| self.snapshot_node(child))
            .collect::<Vec<_>>();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        TimerSnapshot {
            name: node.name.to_string(),
            total_nanos: node.total_nanos,
            count: node.count,
            children,
        }
    }
}
