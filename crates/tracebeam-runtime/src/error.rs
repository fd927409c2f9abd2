// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

/// Errors that can occur when starting or running the agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
