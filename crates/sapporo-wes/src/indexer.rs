// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps the SQLite index in sync with disk.
//!
//! Each pass:
//! 1. scans the sharded run tree and loads every run summary,
//! 2. reconciles non-terminal runs whose dispatcher is gone to
//!    `SYSTEM_ERROR`,
//! 3. rebuilds the index into a temp database and atomically renames it
//!    over `sapporo.db`,
//! 4. optionally removes run directories older than the configured age.
//!
//! The first pass runs at startup, which is what recovers runs that were
//! in flight when a previous service process died.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, Index};
use crate::error::Result;
use crate::run_store::{RunDirEntry, RunStore};
use crate::schemas::RunSummary;
use crate::state::State;
use crate::supervisor::pid_is_alive;

/// A run whose state file is younger than this is never reconciled for a
/// missing PID: the supervisor may not have recorded it yet.
const RECONCILE_GRACE: Duration = Duration::from_secs(60);

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Time between snapshot rebuilds.
    pub interval: Duration,
    /// When set, remove run directories whose start_time is older than this
    /// many days.
    pub remove_older_than_days: Option<u32>,
}

/// Background worker that rebuilds the run index.
pub struct Indexer {
    store: RunStore,
    index: Arc<Index>,
    config: IndexerConfig,
    shutdown: Arc<Notify>,
}

impl Indexer {
    pub fn new(store: RunStore, index: Arc<Index>, config: IndexerConfig) -> Self {
        Self {
            store,
            index,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the indexer loop. A pass runs immediately on startup, then every
    /// `interval` until shutdown is signaled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            remove_older_than_days = ?self.config.remove_older_than_days,
            "indexer started"
        );

        if let Err(e) = self.pass().await {
            error!(error = %e, "startup index pass failed");
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("indexer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.pass().await {
                        error!(error = %e, "index pass failed");
                    }
                }
            }
        }

        info!("indexer stopped");
    }

    /// One full snapshot pass.
    pub async fn pass(&self) -> Result<()> {
        let run_ids = self.store.glob_run_ids().await?;
        let mut entries: Vec<(RunSummary, Option<String>)> = Vec::with_capacity(run_ids.len());

        for run_id in run_ids {
            self.reconcile(&run_id).await;
            // The directory may have been deleted between globbing and now
            if !self.store.exists(&run_id).await {
                continue;
            }
            let summary = self.store.load_summary(&run_id).await;
            let username = self.store.read_username(&run_id).await;
            entries.push((summary, username));
        }

        let removed = self.cleanup_old(&mut entries).await;
        self.rebuild(&entries).await?;

        debug!(
            indexed = entries.len(),
            removed = removed,
            "index snapshot rebuilt"
        );
        Ok(())
    }

    /// Rewrite a dead run to `SYSTEM_ERROR`.
    ///
    /// A run counts as dead when its state is non-terminal and its recorded
    /// PID is no longer alive, or no PID was ever recorded and the state
    /// file is old enough that the fork cannot still be in progress.
    async fn reconcile(&self, run_id: &str) {
        let state = self.store.read_state(run_id).await;
        if state.is_terminal() || state == State::Unknown {
            return;
        }
        let dead = match self.store.read_pid(run_id).await {
            Some(pid) => !pid_is_alive(pid),
            None => self.state_file_older_than(run_id, RECONCILE_GRACE).await,
        };
        if !dead {
            return;
        }

        warn!(run_id = %run_id, state = %state, "dispatcher gone, reconciling to SYSTEM_ERROR");
        if let Err(e) = self.store.write_state(run_id, State::SystemError).await {
            warn!(run_id = %run_id, error = %e, "reconcile state write failed");
            return;
        }
        let _ = self
            .store
            .append_system_log(
                run_id,
                "dispatcher process disappeared; state reconciled to SYSTEM_ERROR",
            )
            .await;
        if self.store.read_exit_code(run_id).await.is_none() {
            let _ = self.store.write_entry(run_id, RunDirEntry::ExitCode, "1").await;
        }
        if self
            .store
            .read_entry(run_id, RunDirEntry::EndTime)
            .await
            .is_none()
        {
            let _ = self
                .store
                .write_entry(run_id, RunDirEntry::EndTime, &crate::now_rfc3339())
                .await;
        }
    }

    async fn state_file_older_than(&self, run_id: &str, age: Duration) -> bool {
        let path = self.store.entry_path(run_id, RunDirEntry::StateFile);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|elapsed| elapsed > age),
            Err(_) => false,
        }
    }

    /// Remove run directories older than the configured cutoff. Removed
    /// entries become `DELETED` tombstones in the snapshot.
    async fn cleanup_old(&self, entries: &mut Vec<(RunSummary, Option<String>)>) -> u64 {
        let Some(days) = self.config.remove_older_than_days else {
            return 0;
        };
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut removed = 0u64;
        for (summary, _) in entries.iter_mut() {
            let Some(start_time) = &summary.start_time else {
                continue;
            };
            if start_time.as_str() >= cutoff.as_str() {
                continue;
            }
            match self.store.delete(&summary.run_id).await {
                Ok(()) => {
                    info!(run_id = %summary.run_id, start_time = %start_time, "removed old run directory");
                    summary.state = State::Deleted;
                    removed += 1;
                }
                Err(e) => {
                    warn!(run_id = %summary.run_id, error = %e, "failed to remove old run directory");
                }
            }
        }
        removed
    }

    /// Build the snapshot in a temp database, then rename it into place and
    /// swap the reader pool.
    async fn rebuild(&self, entries: &[(RunSummary, Option<String>)]) -> Result<()> {
        let final_path = self.index.path().to_path_buf();
        let tmp_path = final_path.with_file_name(format!(
            "{}.tmp-{}",
            db::DATABASE_NAME,
            Uuid::new_v4().simple()
        ));

        let result = async {
            let pool = db::open_pool(&tmp_path).await?;
            for (summary, username) in entries {
                db::upsert_run(&pool, summary, username.as_deref()).await?;
            }
            pool.close().await;
            Ok::<_, crate::error::AppError>(())
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        // WAL sidecar files belong to the temp db; checkpointing happened on
        // close, so only the main file needs to move.
        for suffix in ["-wal", "-shm"] {
            let _ = tokio::fs::remove_file(format!("{}{suffix}", tmp_path.display())).await;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;
        self.index.reopen().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_store::NewRun;
    use crate::schemas::RunRequest;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn new_run(tags: &[(&str, &str)]) -> NewRun {
        NewRun {
            run_request: RunRequest {
                workflow_params: None,
                workflow_type: "CWL".into(),
                workflow_type_version: "v1.2".into(),
                tags: Some(
                    tags.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<HashMap<_, _>>(),
                ),
                workflow_engine: "cwltool".into(),
                workflow_engine_version: None,
                workflow_engine_parameters: None,
                workflow_url: "wf.cwl".into(),
                workflow_attachment_obj: vec![],
            },
            username: None,
            engine_params: String::new(),
            service_config: serde_json::json!({}),
            attachments: vec![],
        }
    }

    async fn fixture() -> (TempDir, RunStore, Arc<Index>, Indexer) {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let index = Arc::new(Index::open(tmp.path()).await.unwrap());
        let indexer = Indexer::new(
            store.clone(),
            index.clone(),
            IndexerConfig {
                interval: Duration::from_secs(60),
                remove_older_than_days: None,
            },
        );
        (tmp, store, index, indexer)
    }

    #[tokio::test]
    async fn test_pass_indexes_disk_runs() {
        let (_tmp, store, index, indexer) = fixture().await;
        let a = store.create(new_run(&[("env", "prod")])).await.unwrap();
        let b = store.create(new_run(&[])).await.unwrap();

        indexer.pass().await.unwrap();

        let pool = index.pool().await;
        let count = db::count_runs(&pool, &db::RunFilter::default()).await.unwrap();
        assert_eq!(count, 2);
        let filter = db::RunFilter {
            run_ids: Some(vec![a.clone(), b.clone()]),
            ..Default::default()
        };
        assert_eq!(db::count_runs(&pool, &filter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_rename_replaces_database() {
        let (tmp, store, index, indexer) = fixture().await;
        store.create(new_run(&[])).await.unwrap();
        indexer.pass().await.unwrap();
        assert!(tmp.path().join(db::DATABASE_NAME).exists());
        // No temp databases left behind
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = index;
    }

    #[tokio::test]
    async fn test_dead_pid_reconciled_to_system_error() {
        let (_tmp, store, _index, indexer) = fixture().await;
        let run_id = store.create(new_run(&[])).await.unwrap();
        store.write_state(&run_id, State::Initializing).await.unwrap();
        store.write_state(&run_id, State::Running).await.unwrap();
        store
            .write_entry(&run_id, RunDirEntry::Pid, "2147483646")
            .await
            .unwrap();

        indexer.pass().await.unwrap();

        assert_eq!(store.read_state(&run_id).await, State::SystemError);
        assert_eq!(store.read_exit_code(&run_id).await, Some(1));
        assert!(
            store
                .read_entry(&run_id, RunDirEntry::EndTime)
                .await
                .is_some()
        );
        let log = store.load_log(&run_id).await;
        assert!(
            log.run_log
                .system_logs
                .unwrap()
                .iter()
                .any(|l| l.contains("SYSTEM_ERROR"))
        );
    }

    #[tokio::test]
    async fn test_live_pid_left_alone() {
        let (_tmp, store, _index, indexer) = fixture().await;
        let run_id = store.create(new_run(&[])).await.unwrap();
        store.write_state(&run_id, State::Initializing).await.unwrap();
        store.write_state(&run_id, State::Running).await.unwrap();
        store
            .write_entry(&run_id, RunDirEntry::Pid, &std::process::id().to_string())
            .await
            .unwrap();

        indexer.pass().await.unwrap();
        assert_eq!(store.read_state(&run_id).await, State::Running);
    }

    #[tokio::test]
    async fn test_fresh_queued_run_not_reconciled() {
        let (_tmp, store, _index, indexer) = fixture().await;
        // No pid recorded yet, but the state file was written moments ago
        let run_id = store.create(new_run(&[])).await.unwrap();
        indexer.pass().await.unwrap();
        assert_eq!(store.read_state(&run_id).await, State::Queued);
    }

    #[tokio::test]
    async fn test_terminal_run_not_touched() {
        let (_tmp, store, _index, indexer) = fixture().await;
        let run_id = store.create(new_run(&[])).await.unwrap();
        store.write_state(&run_id, State::Canceling).await.unwrap();
        store.write_state(&run_id, State::Canceled).await.unwrap();
        store
            .write_entry(&run_id, RunDirEntry::Pid, "2147483646")
            .await
            .unwrap();

        indexer.pass().await.unwrap();
        assert_eq!(store.read_state(&run_id).await, State::Canceled);
    }

    #[tokio::test]
    async fn test_age_cleanup_removes_and_tombstones() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::new(tmp.path());
        let index = Arc::new(Index::open(tmp.path()).await.unwrap());
        let indexer = Indexer::new(
            store.clone(),
            index.clone(),
            IndexerConfig {
                interval: Duration::from_secs(60),
                remove_older_than_days: Some(7),
            },
        );

        let old_run = store.create(new_run(&[])).await.unwrap();
        store.write_state(&old_run, State::Canceling).await.unwrap();
        store.write_state(&old_run, State::Canceled).await.unwrap();
        store
            .write_entry(&old_run, RunDirEntry::StartTime, "2020-01-01T00:00:00Z")
            .await
            .unwrap();
        let fresh_run = store.create(new_run(&[])).await.unwrap();
        store
            .write_entry(
                &fresh_run,
                RunDirEntry::StartTime,
                &crate::now_rfc3339(),
            )
            .await
            .unwrap();

        indexer.pass().await.unwrap();

        assert!(!store.exists(&old_run).await);
        assert!(store.exists(&fresh_run).await);

        let pool = index.pool().await;
        let filter = db::RunFilter {
            run_ids: Some(vec![old_run.clone()]),
            ..Default::default()
        };
        let (rows, _) = db::list_runs(
            &pool,
            &filter,
            10,
            None,
            db::SortOrder::Desc,
            index.token_signer(),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "DELETED");
    }
}
