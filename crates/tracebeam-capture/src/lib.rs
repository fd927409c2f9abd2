// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

//! In-process transaction capture model for an APM agent.
//!
//! One [`transaction::Transaction`] is created per traced unit of work. The
//! instrumentation layer drives its entry stack and timer tree from the owning
//! thread; background tasks built on [`scheduled_task::ScheduledTask`] read it
//! from other threads to trigger partial stores and to sample call stacks.

pub mod entry_stack;
pub mod profile;
pub mod scheduled_task;
pub mod tasks;
pub mod timer_tree;
pub mod transaction;
