// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `mailpilotd`: loads a [`mailpilot_core::config::DaemonConfig`] and runs
//! the daemon core until interrupted.
//!
//! Config loading here is intentionally minimal — YAML parsing and
//! environment-variable interpolation are out of scope for this crate (see
//! `config.rs`). This binary reads a JSON document instead, from the path
//! given as the first argument or `$MAILPILOT_CONFIG`, defaulting to
//! `mailpilot.json` in the working directory.

use std::env;
use std::sync::Arc;

use log::{error, info};
use mailpilot_core::config::DaemonConfig;
use mailpilot_core::daemon::Mailpilot;

// jemalloc releases memory back to the OS, unlike the default system allocator.
// This matters here because IMAP sessions and LLM response bodies churn through
// short-lived buffers continuously over the daemon's lifetime.
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn config_path() -> String {
    env::args()
        .nth(1)
        .or_else(|| env::var("MAILPILOT_CONFIG").ok())
        .unwrap_or_else(|| "mailpilot.json".to_string())
}

fn load_config(path: &str) -> std::io::Result<DaemonConfig> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let path = config_path();
    info!("loading configuration from {path}");
    let config = load_config(&path)?;

    let mailpilot = Mailpilot::new(config)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let shutdown_handle = mailpilot.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {e}");
            return;
        }
        info!("shutdown signal received");
        shutdown_handle.request_shutdown();
    });

    let run_handle: Arc<Mailpilot> = mailpilot;
    if let Err(e) = run_handle.run().await {
        error!("mailpilot exited with error: {e}");
        return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
    }

    info!("mailpilot shut down cleanly");
    Ok(())
}
