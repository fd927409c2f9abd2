// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

//! Agent runtime: configuration plus the coordinator that wires transaction
//! capture, interval aggregation and gauge polling together for the
//! instrumentation layer.

pub mod config;
pub mod error;
pub mod services;
