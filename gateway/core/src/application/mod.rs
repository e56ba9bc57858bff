// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// Application Layer
//
// Use cases built on the domain ports: executing one backend call,
// routing inbound traffic, and waiting for replies as a caller.

pub mod client;
pub mod execution;
pub mod router;
pub mod runtime;

pub use client::{ClientError, GatewayClient};
pub use execution::{ExecutionError, FailureClass, RequestExecutor};
pub use router::{RouteOutcome, RouterHandle, RouterSettings, RoutingOrchestrator};
pub use runtime::GatewayRuntime;
