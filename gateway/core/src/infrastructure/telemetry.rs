// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// Logging setup shared by every process embedding the gateway core.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::domain::config::LoggingConfig;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "text" => builder.compact().try_init(),
        other => anyhow::bail!("Unknown log format '{}'. Expected 'json' or 'text'", other),
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")
}
