// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem layout and I/O for run directories.
//!
//! The filesystem is the system of record: every answer served for a single
//! run is reconstructed from the files below, never from the index.
//!
//! Layout per run (sharded by the first two characters of the run id):
//!
//! ```text
//! {run_dir}/{id[:2]}/{id}/
//!   run_request.json   sapporo_config.json   state.txt
//!   start_time.txt     end_time.txt          exit_code.txt
//!   run.pid            stdout.log            stderr.log
//!   cmd.txt            workflow_engine_params.txt
//!   outputs/           outputs.json          exe/
//!   username.txt       system_logs.json      ro-crate-metadata.json
//! ```
//!
//! Single-file writes go through write-temp-then-rename so readers never
//! observe a torn file. Run creation builds the whole directory under a
//! dot-prefixed temp name and renames it into place, so a partially
//! materialized run is never visible under the public sharded path.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::schemas::{FileObject, Log, RunLog, RunRequest, RunSummary};
use crate::secure_path::validate_subpath;
use crate::state::State;

/// Largest stdout/stderr slice returned inline in a `RunLog`.
const STREAM_TAIL_BYTES: u64 = 64 * 1024;

/// Files and directories inside a run directory, keyed for uniform access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDirEntry {
    RunRequest,
    SapporoConfig,
    StateFile,
    StartTime,
    EndTime,
    ExitCode,
    Pid,
    Stdout,
    Stderr,
    Cmd,
    WfEngineParams,
    OutputsDir,
    Outputs,
    ExeDir,
    WfParams,
    Username,
    SystemLogs,
    RoCrate,
}

impl RunDirEntry {
    pub fn rel_path(self) -> &'static str {
        match self {
            RunDirEntry::RunRequest => "run_request.json",
            RunDirEntry::SapporoConfig => "sapporo_config.json",
            RunDirEntry::StateFile => "state.txt",
            RunDirEntry::StartTime => "start_time.txt",
            RunDirEntry::EndTime => "end_time.txt",
            RunDirEntry::ExitCode => "exit_code.txt",
            RunDirEntry::Pid => "run.pid",
            RunDirEntry::Stdout => "stdout.log",
            RunDirEntry::Stderr => "stderr.log",
            RunDirEntry::Cmd => "cmd.txt",
            RunDirEntry::WfEngineParams => "workflow_engine_params.txt",
            RunDirEntry::OutputsDir => "outputs",
            RunDirEntry::Outputs => "outputs.json",
            RunDirEntry::ExeDir => "exe",
            RunDirEntry::WfParams => "exe/workflow_params.json",
            RunDirEntry::Username => "username.txt",
            RunDirEntry::SystemLogs => "system_logs.json",
            RunDirEntry::RoCrate => "ro-crate-metadata.json",
        }
    }
}

/// An uploaded attachment staged during run creation.
#[derive(Debug, Clone)]
pub struct StagedAttachment {
    /// Sanitized path relative to `exe/`.
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Everything needed to materialize a new run directory.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_request: RunRequest,
    pub username: Option<String>,
    /// Pre-assembled engine parameter string written to
    /// `workflow_engine_params.txt` for the dispatcher.
    pub engine_params: String,
    /// Captured service configuration (`sapporo_config.json`).
    pub service_config: serde_json::Value,
    pub attachments: Vec<StagedAttachment>,
}

/// Handle on the sharded run-directory tree.
#[derive(Debug, Clone)]
pub struct RunStore {
    base: PathBuf,
}

impl RunStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `{base}/{id[:2]}/{id}`. The shard split is an internal detail and
    /// never appears in any API response.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        let shard = &run_id[..2.min(run_id.len())];
        self.base.join(shard).join(run_id)
    }

    pub fn entry_path(&self, run_id: &str, entry: RunDirEntry) -> PathBuf {
        self.run_dir(run_id).join(entry.rel_path())
    }

    /// A run exists once its request file is visible under the public path.
    pub async fn exists(&self, run_id: &str) -> bool {
        fs::try_exists(self.entry_path(run_id, RunDirEntry::RunRequest))
            .await
            .unwrap_or(false)
    }

    /// Enumerate all run ids on disk by scanning for `run_request.json`
    /// two levels below the base directory.
    pub async fn glob_run_ids(&self) -> Result<Vec<String>> {
        let mut run_ids = Vec::new();
        let mut shards = match fs::read_dir(&self.base).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(run_ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut runs = match fs::read_dir(shard.path()).await {
                Ok(d) => d,
                Err(_) => continue,
            };
            while let Some(run) = runs.next_entry().await? {
                let name = run.file_name().to_string_lossy().to_string();
                // Skip in-flight temp directories
                if name.starts_with('.') {
                    continue;
                }
                if fs::try_exists(run.path().join(RunDirEntry::RunRequest.rel_path()))
                    .await
                    .unwrap_or(false)
                {
                    run_ids.push(name);
                }
            }
        }
        Ok(run_ids)
    }

    // === single-file access ===

    /// Atomic single-file replace: write `<name>.tmp`, then rename. One
    /// retry on a rename race.
    pub async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp_name = path
            .file_name()
            .ok_or_else(|| AppError::Internal("write target has no file name".into()))?
            .to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, content).await?;
        if let Err(first) = fs::rename(&tmp, path).await {
            warn!(path = %path.display(), error = %first, "rename raced, retrying once");
            fs::rename(&tmp, path).await?;
        }
        Ok(())
    }

    pub async fn write_entry(
        &self,
        run_id: &str,
        entry: RunDirEntry,
        content: &str,
    ) -> Result<()> {
        self.write_atomic(&self.entry_path(run_id, entry), content.as_bytes())
            .await
    }

    /// Read a file as a trimmed string. A missing file is `None`, never an
    /// error.
    pub async fn read_entry(&self, run_id: &str, entry: RunDirEntry) -> Option<String> {
        let path = self.entry_path(run_id, entry);
        match fs::read_to_string(&path).await {
            Ok(content) => Some(content.trim().to_string()),
            Err(_) => None,
        }
    }

    /// Current state of the run. A missing or unreadable `state.txt` maps to
    /// `UNKNOWN`.
    pub async fn read_state(&self, run_id: &str) -> State {
        match self.read_entry(run_id, RunDirEntry::StateFile).await {
            Some(word) => word.parse().unwrap_or(State::Unknown),
            None => State::Unknown,
        }
    }

    /// Transition the run to `new_state`, enforcing the state machine.
    ///
    /// The current state is read immediately before the write; a forbidden
    /// transition leaves the file untouched and reports a conflict. Callers
    /// that hold the per-run write lock get serialization between HTTP
    /// writers; the dispatcher process writes the same file and wins or
    /// loses this race by the rules documented in [`State::can_transition`].
    pub async fn write_state(&self, run_id: &str, new_state: State) -> Result<State> {
        let current = self.read_state(run_id).await;
        if !current.can_transition(new_state) {
            return Err(AppError::Conflict(format!(
                "cannot transition run from {current} to {new_state}"
            )));
        }
        self.write_entry(run_id, RunDirEntry::StateFile, new_state.as_str())
            .await?;
        Ok(current)
    }

    pub async fn read_pid(&self, run_id: &str) -> Option<i32> {
        self.read_entry(run_id, RunDirEntry::Pid)
            .await?
            .parse()
            .ok()
    }

    pub async fn read_exit_code(&self, run_id: &str) -> Option<i32> {
        self.read_entry(run_id, RunDirEntry::ExitCode)
            .await?
            .parse()
            .ok()
    }

    pub async fn read_username(&self, run_id: &str) -> Option<String> {
        self.read_entry(run_id, RunDirEntry::Username).await
    }

    pub async fn read_request(&self, run_id: &str) -> Option<RunRequest> {
        let content = self.read_entry(run_id, RunDirEntry::RunRequest).await?;
        serde_json::from_str(&content).ok()
    }

    /// Append one line to `system_logs.json` (a JSON array of strings).
    pub async fn append_system_log(&self, run_id: &str, message: &str) -> Result<()> {
        let mut logs: Vec<String> = match self.read_entry(run_id, RunDirEntry::SystemLogs).await {
            Some(content) => serde_json::from_str(&content).unwrap_or_default(),
            None => Vec::new(),
        };
        logs.push(message.to_string());
        self.write_entry(
            run_id,
            RunDirEntry::SystemLogs,
            &serde_json::to_string_pretty(&logs)?,
        )
        .await
    }

    // === run creation ===

    /// Materialize a run directory and return its id.
    ///
    /// The directory is assembled under `{shard}/.{id}.tmp` and renamed into
    /// place with `state.txt=QUEUED` already present, so observers either see
    /// the full directory contract or nothing. The temp directory is held by
    /// a [`TempDirGuard`], so it is removed on any exit path, including this
    /// future being dropped mid-materialize when the client disconnects.
    pub async fn create(&self, new_run: NewRun) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let final_dir = self.run_dir(&run_id);
        let shard_dir = final_dir
            .parent()
            .ok_or_else(|| AppError::Internal("run dir has no parent".into()))?
            .to_path_buf();
        let tmp_dir = shard_dir.join(format!(".{run_id}.tmp"));
        let guard = TempDirGuard::new(tmp_dir.clone());

        self.materialize(&tmp_dir, &new_run).await?;
        fs::rename(&tmp_dir, &final_dir)
            .await
            .map_err(storage_error)?;
        guard.disarm();

        debug!(run_id = %run_id, dir = %final_dir.display(), "run directory created");
        Ok(run_id)
    }

    async fn materialize(&self, dir: &Path, new_run: &NewRun) -> Result<()> {
        fs::create_dir_all(dir).await.map_err(storage_error)?;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await?;

        // exe/ and outputs/ are written by the engine container, which may
        // run as an unprivileged user.
        for sub in [RunDirEntry::ExeDir, RunDirEntry::OutputsDir] {
            let path = dir.join(sub.rel_path());
            fs::create_dir_all(&path).await.map_err(storage_error)?;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).await?;
        }

        let write = |rel: &'static str, content: Vec<u8>| {
            let path = dir.join(rel);
            async move {
                fs::write(&path, content).await.map_err(storage_error)
            }
        };

        write(
            RunDirEntry::SapporoConfig.rel_path(),
            serde_json::to_vec_pretty(&new_run.service_config)?,
        )
        .await?;
        write(
            RunDirEntry::RunRequest.rel_path(),
            serde_json::to_vec_pretty(&new_run.run_request)?,
        )
        .await?;

        // workflow_params may be a JSON object or an opaque string; a string
        // is written verbatim so engines that expect non-JSON params work.
        let params_bytes = match &new_run.run_request.workflow_params {
            Some(serde_json::Value::String(s)) => s.clone().into_bytes(),
            Some(value) => serde_json::to_vec_pretty(value)?,
            None => b"{}".to_vec(),
        };
        write(RunDirEntry::WfParams.rel_path(), params_bytes).await?;
        write(
            RunDirEntry::WfEngineParams.rel_path(),
            new_run.engine_params.clone().into_bytes(),
        )
        .await?;

        for attachment in &new_run.attachments {
            let path = dir
                .join(RunDirEntry::ExeDir.rel_path())
                .join(&attachment.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(storage_error)?;
            }
            fs::write(&path, &attachment.bytes)
                .await
                .map_err(storage_error)?;
        }

        if let Some(username) = &new_run.username {
            write(RunDirEntry::Username.rel_path(), username.clone().into_bytes()).await?;
        }

        write(
            RunDirEntry::StateFile.rel_path(),
            State::Queued.as_str().as_bytes().to_vec(),
        )
        .await?;
        Ok(())
    }

    // === reconstruction ===

    /// Reconstruct a [`RunSummary`] from disk. Always succeeds for an
    /// existing directory; missing files become null fields.
    pub async fn load_summary(&self, run_id: &str) -> RunSummary {
        let tags = self
            .read_request(run_id)
            .await
            .map(|req| req.tags_or_empty())
            .unwrap_or_default();
        RunSummary {
            run_id: run_id.to_string(),
            state: self.read_state(run_id).await,
            start_time: self.read_entry(run_id, RunDirEntry::StartTime).await,
            end_time: self.read_entry(run_id, RunDirEntry::EndTime).await,
            tags,
        }
    }

    /// Reconstruct the full [`RunLog`] served by `GET /runs/{id}`.
    pub async fn load_log(&self, run_id: &str) -> RunLog {
        let cmd = self
            .read_entry(run_id, RunDirEntry::Cmd)
            .await
            .map(|line| line.split_whitespace().map(str::to_string).collect());
        let system_logs: Option<Vec<String>> = match self
            .read_entry(run_id, RunDirEntry::SystemLogs)
            .await
        {
            Some(content) => serde_json::from_str(&content).ok(),
            None => None,
        };
        let outputs = match self.read_entry(run_id, RunDirEntry::Outputs).await {
            Some(content) => serde_json::from_str(&content).ok(),
            None => None,
        };

        RunLog {
            run_id: run_id.to_string(),
            request: self.read_request(run_id).await,
            state: self.read_state(run_id).await,
            run_log: Log {
                name: None,
                cmd,
                start_time: self.read_entry(run_id, RunDirEntry::StartTime).await,
                end_time: self.read_entry(run_id, RunDirEntry::EndTime).await,
                stdout: self.read_stream_tail(run_id, RunDirEntry::Stdout).await,
                stderr: self.read_stream_tail(run_id, RunDirEntry::Stderr).await,
                exit_code: self.read_exit_code(run_id).await,
                system_logs,
            },
            task_logs_url: None,
            task_logs: None,
            outputs,
        }
    }

    /// Last [`STREAM_TAIL_BYTES`] of an engine stream. Engine logs can reach
    /// gigabytes; full content stays available through the outputs endpoints.
    async fn read_stream_tail(&self, run_id: &str, entry: RunDirEntry) -> Option<String> {
        let path = self.entry_path(run_id, entry);
        let meta = fs::metadata(&path).await.ok()?;
        let bytes = fs::read(&path).await.ok()?;
        let skip = meta.len().saturating_sub(STREAM_TAIL_BYTES) as usize;
        Some(String::from_utf8_lossy(&bytes[skip.min(bytes.len())..]).into_owned())
    }

    // === outputs ===

    /// Walk `outputs/` recursively and list files relative to it, with
    /// forward slashes. Paths never leave the outputs tree by construction.
    pub async fn list_outputs(&self, run_id: &str, base_url: &str) -> Result<Vec<FileObject>> {
        let outputs_dir = self.entry_path(run_id, RunDirEntry::OutputsDir);
        let mut files = Vec::new();
        collect_files(&outputs_dir, &outputs_dir, &mut files).await?;
        files.sort();
        Ok(files
            .into_iter()
            .map(|rel| FileObject {
                file_url: format!("{base_url}/runs/{run_id}/outputs/{rel}"),
                file_name: rel,
            })
            .collect())
    }

    /// Resolve a requested output path, refusing anything that could escape
    /// `outputs/`.
    pub fn resolve_output_path(&self, run_id: &str, relpath: &str) -> Result<PathBuf> {
        let rel = validate_subpath(relpath)
            .ok_or_else(|| AppError::InvalidRequest(format!("invalid output path: {relpath}")))?;
        Ok(self
            .entry_path(run_id, RunDirEntry::OutputsDir)
            .join(rel))
    }

    /// Resolve a requested run-directory path (the `data/` endpoint). Same
    /// traversal rules, anchored at the run directory instead of `outputs/`.
    pub fn resolve_data_path(&self, run_id: &str, relpath: &str) -> Result<PathBuf> {
        let rel = validate_subpath(relpath)
            .ok_or_else(|| AppError::InvalidRequest(format!("invalid path: {relpath}")))?;
        Ok(self.run_dir(run_id).join(rel))
    }

    // === deletion ===

    /// Remove the run directory. The `DELETING` marker is written first so
    /// concurrent readers see the transition; the index keeps the `DELETED`
    /// tombstone once the directory is gone.
    pub async fn delete(&self, run_id: &str) -> Result<()> {
        // Deliberately unchecked: deleting an in-flight run is allowed (the
        // dispatcher will fail on the vanished directory and exit).
        self.write_entry(run_id, RunDirEntry::StateFile, State::Deleting.as_str())
            .await?;
        fs::remove_dir_all(self.run_dir(run_id))
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

/// Removes a temp run directory on drop unless disarmed.
///
/// Run creation suspends on filesystem awaits; if the request future is
/// dropped at one of those points, only `Drop` still runs, so cleanup must
/// live there rather than after the `.await`.
struct TempDirGuard {
    path: Option<PathBuf>,
}

impl TempDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Keep the directory: it has been renamed into its final place.
    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_dir_all(&path);
        }
    }
}

fn storage_error(e: std::io::Error) -> AppError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        AppError::Internal("storage full".into())
    } else {
        AppError::StorageIo(e)
    }
}

/// Depth-first file listing; `Box::pin` for the async recursion.
fn collect_files<'a>(
    root: &'a Path,
    dir: &'a Path,
    out: &'a mut Vec<String>,
) -> futures::future::BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut entries = match fs::read_dir(dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                collect_files(root, &path, out).await?;
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    })
}
