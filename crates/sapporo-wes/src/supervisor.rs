// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervision of dispatcher processes.
//!
//! Each run forks the dispatcher (`run.sh <run_dir>`) as a detached child in
//! its own process group, so signals delivered to the HTTP process never
//! reach in-flight workflow engines. The dispatcher owns all lifecycle
//! writes inside the run directory (timestamps, state transitions,
//! `exit_code.txt`), because those must survive this process dying; the
//! supervisor only records the PID, reaps the child, and refreshes the
//! run's index row on exit.
//!
//! Stdout and stderr are redirected to `stdout.log`/`stderr.log` as file
//! handles rather than pipes: a pipe's read end closes when the handle is
//! dropped, and a late write would then kill the dispatcher with SIGPIPE.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::{AppError, Result};
use crate::run_store::{RunDirEntry, RunStore};
use crate::state::State;

/// Outcome reported by `POST /runs/{id}/cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// `CANCELING` written and SIGUSR1 delivered.
    Signaled,
    /// The run already reached a terminal state; nothing to do.
    AlreadyTerminal,
    /// `CANCELING` written but the PID was gone; the indexer reconciles.
    ProcessGone,
}

/// Fork the dispatcher for a freshly created run.
///
/// The child gets its own process group, a closed stdin, and the run's log
/// files as stdout/stderr. The returned future completes immediately after
/// the fork; a background task waits for the child and updates the index
/// row when the dispatcher exits. `run_lock` is the run's advisory mutex;
/// the waiter holds it while touching the index so its refresh serializes
/// with cancel and delete handlers on the same run.
pub async fn fork_dispatcher(
    store: &RunStore,
    index: &Arc<db::Index>,
    run_sh: &Path,
    run_id: &str,
    run_lock: Arc<tokio::sync::Mutex<()>>,
) -> Result<()> {
    let run_dir = store.run_dir(run_id);
    let stdout = std::fs::File::create(store.entry_path(run_id, RunDirEntry::Stdout))?;
    let stderr = std::fs::File::create(store.entry_path(run_id, RunDirEntry::Stderr))?;

    let mut cmd = Command::new("/bin/bash");
    cmd.arg(run_sh)
        .arg(&run_dir)
        .current_dir(&run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    cmd.as_std_mut().process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        AppError::Internal(format!("failed to fork dispatcher for run {run_id}: {e}"))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| AppError::Internal("dispatcher exited before pid was recorded".into()))?;
    store
        .write_entry(run_id, RunDirEntry::Pid, &pid.to_string())
        .await?;
    info!(run_id = %run_id, pid = pid, "dispatcher forked");

    let store = store.clone();
    let index = index.clone();
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                debug!(run_id = %run_id, status = %status, "dispatcher exited");
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to reap dispatcher");
            }
        }
        // The dispatcher has written its terminal state; mirror it into the
        // index so list queries converge before the next snapshot. Holding
        // the run lock keeps this from resurrecting the index row of a run
        // that a concurrent DELETE has just tombstoned: after delete_one
        // releases the lock the directory is gone and the exists check
        // skips the upsert.
        let _guard = run_lock.lock().await;
        if store.exists(&run_id).await {
            let summary = store.load_summary(&run_id).await;
            let username = store.read_username(&run_id).await;
            let pool = index.pool().await;
            if let Err(e) = db::upsert_run(&pool, &summary, username.as_deref()).await {
                warn!(run_id = %run_id, error = %e, "failed to refresh index row");
            }
        }
    });
    Ok(())
}

/// Cooperatively cancel a run.
///
/// Writes `CANCELING` first (serialized through the state machine), then
/// signals the recorded PID with SIGUSR1. The dispatcher finalizes to
/// `CANCELED`. All outcomes are 200s; only a state conflict on a
/// non-cancelable, non-terminal state surfaces as an error.
pub async fn cancel_run(store: &RunStore, run_id: &str) -> Result<CancelOutcome> {
    let current = store.read_state(run_id).await;
    if current.is_terminal() {
        return Ok(CancelOutcome::AlreadyTerminal);
    }
    if current == State::Canceling {
        // Double-cancel: the first request already signaled.
        return Ok(CancelOutcome::Signaled);
    }
    store.write_state(run_id, State::Canceling).await?;

    let Some(pid) = store.read_pid(run_id).await else {
        store
            .append_system_log(run_id, "cancel requested but no dispatcher pid was recorded")
            .await?;
        return Ok(CancelOutcome::ProcessGone);
    };
    match signal::kill(Pid::from_raw(pid), Signal::SIGUSR1) {
        Ok(()) => {
            info!(run_id = %run_id, pid = pid, "SIGUSR1 delivered");
            Ok(CancelOutcome::Signaled)
        }
        Err(Errno::ESRCH) => {
            store
                .append_system_log(run_id, "cancel requested but the dispatcher was already gone")
                .await?;
            Ok(CancelOutcome::ProcessGone)
        }
        Err(e) => Err(AppError::Internal(format!(
            "failed to signal dispatcher pid {pid}: {e}"
        ))),
    }
}

/// Whether a recorded dispatcher PID still refers to a live process.
pub fn pid_is_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}
