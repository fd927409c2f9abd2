// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

//! Interval aggregation of completed transactions and periodic gauge polling.
//!
//! [`aggregate::AggregateCollector`] buckets completed transactions into
//! fixed-interval summaries and hands sealed buckets to a single flush worker;
//! [`gauge::GaugeCollector`] polls external attribute sources on a fixed
//! period with per-source failure isolation and deduplicated warnings.

pub mod aggregate;
pub mod clock;
pub mod gauge;
