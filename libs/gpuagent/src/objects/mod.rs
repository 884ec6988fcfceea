// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! API object entities: GPU, GPU watch group and the stateless task.
//!
//! Every stateful entity implements the same shape the engine dispatches on:
//! a factory, create/update/delete handlers and a read path. Entities are
//! shared as `Arc`s; interior state the engine mutates is behind
//! `parking_lot` locks so concurrent readers stay safe through the
//! delayed-delete window.

pub mod gpu;
pub mod gpu_watch;
pub mod task;

pub use gpu::{Gpu, GpuUpdateMask};
pub use gpu_watch::GpuWatch;
