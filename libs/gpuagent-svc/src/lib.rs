// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Service boundary of the GPU agent.
//!
//! A thin HTTP/JSON adapter over the agent core, with WebSocket streams for
//! event and watch-snapshot subscribers. Holds no core invariants: request
//! DTOs are validated here and handed to the core, responses are the core's
//! records serialized back out.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod server;

pub use server::{router, AppState};

/// Default RPC listen port.
pub const DEFAULT_GRPC_SERVER_PORT: u16 = 21001;
/// Well-known port of the upstream RDC endpoint.
pub const DEFAULT_RDC_SERVER_PORT: u16 = 50051;

/// Agent version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
