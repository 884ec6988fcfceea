// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Status-to-HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpuagent::AgentError;
use serde::Serialize;

/// Wire shape of every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

/// Service-level error: the agent status plus its HTTP rendering.
#[derive(Debug)]
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::EntryNotFound => StatusCode::NOT_FOUND,
            AgentError::EntryExists | AgentError::InUse => StatusCode::CONFLICT,
            AgentError::InvalidArg(_) | AgentError::InvalidOp => StatusCode::BAD_REQUEST,
            AgentError::OpNotSupported => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result alias for handler functions.
pub type ApiResult<T> = Result<T, ApiError>;
