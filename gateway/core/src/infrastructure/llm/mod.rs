// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// LLM Backend Infrastructure - Anti-Corruption Layer Implementations
//
// Each adapter translates between the gateway's ResponsesBackend port and
// an external HTTP API.

pub mod openai;

pub use openai::OpenAIResponsesAdapter;
