// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! HTTP and WebSocket handlers, one module per service area.

pub mod events;
pub mod gpu;
pub mod gpu_watch;
pub mod task;
pub mod topology;

use gpuagent::{AgentError, ArgError, ObjectKey};

use crate::error::ApiError;

/// Parse a path-supplied object key.
pub(crate) fn parse_key(text: &str) -> Result<ObjectKey, ApiError> {
    text.parse::<ObjectKey>()
        .map_err(|_| ApiError(AgentError::InvalidArg(ArgError::BadEnum("object key"))))
}
