// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! sapporo-wes, a GA4GH Workflow Execution Service frontend.
//!
//! Accepts workflow execution requests over HTTP, persists each run on the
//! local filesystem (the system of record), forks a dispatcher that drives
//! the workflow engine in a sibling container, tracks the run lifecycle
//! through `state.txt`, and maintains a disposable SQLite snapshot to serve
//! list queries.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod indexer;
pub mod run_store;
pub mod schemas;
pub mod secure_path;
pub mod server;
pub mod service_info;
pub mod state;
pub mod supervisor;
pub mod validator;

/// Current time as RFC3339 UTC with second precision
/// (`2024-01-01T00:00:00Z`), the timestamp format used throughout the run
/// directory.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
