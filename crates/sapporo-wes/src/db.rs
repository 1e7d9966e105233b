// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite index over the run directories.
//!
//! The index exists to keep `GET /runs` and `system_state_counts` cheap; it
//! is a derived cache, never the system of record. The file may be deleted
//! at any time and is rebuilt wholesale by the indexer, which prepares a
//! fresh database under a temp name and renames it over `sapporo.db`.
//! Because the rename replaces the inode, readers go through [`Index`],
//! which swaps its pool after each rebuild.
//!
//! Timestamps are stored as RFC3339 UTC text: lexicographic order equals
//! chronological order, which keyset pagination relies on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::schemas::RunSummary;
use crate::state::State;

pub const DATABASE_NAME: &str = "sapporo.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id     TEXT PRIMARY KEY,
    state      TEXT NOT NULL,
    start_time TEXT,
    end_time   TEXT,
    username   TEXT,
    tags_json  TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_runs_start_time ON runs (start_time);
CREATE INDEX IF NOT EXISTS idx_runs_state ON runs (state);
"#;

/// Open a pool on the given database file, creating it if needed.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;
    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    Ok(pool)
}

/// Shared handle on the index database whose backing file is atomically
/// replaced by the indexer.
pub struct Index {
    path: PathBuf,
    pool: RwLock<SqlitePool>,
    token_signer: PageTokenSigner,
}

impl Index {
    pub async fn open(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(DATABASE_NAME);
        let pool = open_pool(&path).await?;
        Ok(Self {
            path,
            pool: RwLock::new(pool),
            token_signer: PageTokenSigner::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token_signer(&self) -> &PageTokenSigner {
        &self.token_signer
    }

    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Swap in a pool on the freshly renamed database. The old pool is
    /// closed; in-flight queries on it finish against the unlinked inode.
    pub async fn reopen(&self) -> Result<()> {
        let new_pool = open_pool(&self.path).await?;
        let old = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, new_pool)
        };
        old.close().await;
        Ok(())
    }
}

/// One row of the `runs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub run_id: String,
    pub state: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub username: Option<String>,
    pub tags_json: String,
}

impl RunRow {
    pub fn into_summary(self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            state: self.state.parse().unwrap_or(State::Unknown),
            start_time: self.start_time,
            end_time: self.end_time,
            tags: serde_json::from_str(&self.tags_json).unwrap_or_default(),
        }
    }
}

/// Insert or refresh a single run row. Used at `POST /runs` and when the
/// supervisor reaps a dispatcher, so fresh runs are visible before the next
/// snapshot.
pub async fn upsert_run(
    pool: &SqlitePool,
    summary: &RunSummary,
    username: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, state, start_time, end_time, username, tags_json)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (run_id) DO UPDATE SET
            state = excluded.state,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            tags_json = excluded.tags_json
        "#,
    )
    .bind(&summary.run_id)
    .bind(summary.state.as_str())
    .bind(&summary.start_time)
    .bind(&summary.end_time)
    .bind(username)
    .bind(serde_json::to_string(&summary.tags)?)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the deletion tombstone. The run's directory is already gone; the
/// row is what keeps `DELETED` observable.
pub async fn mark_deleted(pool: &SqlitePool, run_id: &str) -> Result<()> {
    sqlx::query("UPDATE runs SET state = ?, end_time = COALESCE(end_time, ?) WHERE run_id = ?")
        .bind(State::Deleted.as_str())
        .bind(crate::now_rfc3339())
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Filters shared by list and count queries.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<State>,
    pub run_ids: Option<Vec<String>>,
    pub username: Option<String>,
    /// `key:value` pairs ANDed together.
    pub tags: Vec<(String, String)>,
}

impl RunFilter {
    /// Append WHERE clauses; returns the bind values in order. Tag keys are
    /// inlined into the JSON path and therefore restricted to a safe
    /// character set.
    fn build(&self, clauses: &mut Vec<String>, binds: &mut Vec<String>) -> Result<()> {
        if let Some(state) = self.state {
            clauses.push("state = ?".to_string());
            binds.push(state.as_str().to_string());
        }
        if let Some(username) = &self.username {
            clauses.push("username = ?".to_string());
            binds.push(username.clone());
        }
        if let Some(run_ids) = &self.run_ids {
            if run_ids.is_empty() {
                clauses.push("1 = 0".to_string());
            } else {
                let placeholders = vec!["?"; run_ids.len()].join(", ");
                clauses.push(format!("run_id IN ({placeholders})"));
                binds.extend(run_ids.iter().cloned());
            }
        }
        for (key, value) in &self.tags {
            if !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
                || key.is_empty()
            {
                return Err(AppError::InvalidRequest(format!("invalid tag key: {key}")));
            }
            clauses.push(format!("json_extract(tags_json, '$.{key}') = ?"));
            binds.push(value.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// List runs with keyset pagination ordered by `(start_time, run_id)`.
///
/// Returns up to `page_size` rows plus the token for the next page when more
/// rows exist. Runs without a start time sort after everything else in
/// descending order (empty string coalescing).
pub async fn list_runs(
    pool: &SqlitePool,
    filter: &RunFilter,
    page_size: i64,
    page_token: Option<&str>,
    sort_order: SortOrder,
    signer: &PageTokenSigner,
) -> Result<(Vec<RunRow>, Option<String>)> {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    filter.build(&mut clauses, &mut binds)?;

    if let Some(token) = page_token {
        let cursor = signer.decode(token)?;
        let cmp = match sort_order {
            SortOrder::Asc => {
                "(COALESCE(start_time, '') > ? OR (COALESCE(start_time, '') = ? AND run_id > ?))"
            }
            SortOrder::Desc => {
                "(COALESCE(start_time, '') < ? OR (COALESCE(start_time, '') = ? AND run_id < ?))"
            }
        };
        clauses.push(cmp.to_string());
        binds.push(cursor.start_time.clone());
        binds.push(cursor.start_time);
        binds.push(cursor.run_id);
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let order = match sort_order {
        SortOrder::Asc => "ORDER BY COALESCE(start_time, '') ASC, run_id ASC",
        SortOrder::Desc => "ORDER BY COALESCE(start_time, '') DESC, run_id DESC",
    };
    let sql = format!(
        "SELECT run_id, state, start_time, end_time, username, tags_json \
         FROM runs {where_clause} {order} LIMIT ?"
    );

    let mut query = sqlx::query_as::<_, RunRow>(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }
    query = query.bind(page_size + 1);

    let mut rows = query.fetch_all(pool).await?;
    let next_page_token = if rows.len() as i64 > page_size {
        rows.truncate(page_size as usize);
        rows.last().map(|last| {
            signer.encode(&PageCursor {
                start_time: last.start_time.clone().unwrap_or_default(),
                run_id: last.run_id.clone(),
            })
        })
    } else {
        None
    };
    Ok((rows, next_page_token))
}

/// Count rows matching the filter (the `total_runs` field).
pub async fn count_runs(pool: &SqlitePool, filter: &RunFilter) -> Result<u64> {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    filter.build(&mut clauses, &mut binds)?;
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!("SELECT COUNT(*) FROM runs {where_clause}");
    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for bind in &binds {
        query = query.bind(bind);
    }
    let count = query.fetch_one(pool).await?;
    Ok(count as u64)
}

/// Per-state run counts with every known state present (zero-filled).
pub async fn system_state_counts(
    pool: &SqlitePool,
    username: Option<&str>,
) -> Result<HashMap<String, u64>> {
    let rows: Vec<(String, i64)> = match username {
        Some(user) => {
            sqlx::query_as("SELECT state, COUNT(*) FROM runs WHERE username = ? GROUP BY state")
                .bind(user)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query_as("SELECT state, COUNT(*) FROM runs GROUP BY state")
                .fetch_all(pool)
                .await?
        }
    };
    let mut counts: HashMap<String, u64> = State::all()
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for (state, count) in rows {
        counts.insert(state, count as u64);
    }
    Ok(counts)
}

/// Run ids whose start_time is older than the cutoff, for age-based cleanup.
pub async fn list_runs_started_before(
    pool: &SqlitePool,
    cutoff_rfc3339: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT run_id FROM runs WHERE start_time IS NOT NULL AND start_time < ?",
    )
    .bind(cutoff_rfc3339)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// === page tokens ===

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageCursor {
    start_time: String,
    run_id: String,
}

/// HMAC-SHA256 signer for opaque page tokens.
///
/// The secret is random per process: page tokens are session-scoped, so a
/// reset on restart is acceptable and keeps the secret out of configuration.
pub struct PageTokenSigner {
    secret: [u8; 32],
}

impl Default for PageTokenSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTokenSigner {
    pub fn new() -> Self {
        Self {
            secret: rand::random(),
        }
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(data);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn encode(&self, cursor: &PageCursor) -> String {
        let data = serde_json::to_vec(cursor).expect("cursor serializes");
        let signature = self.sign(&data);
        format!("{}.{signature}", URL_SAFE_NO_PAD.encode(&data))
    }

    fn decode(&self, token: &str) -> Result<PageCursor> {
        let invalid = || AppError::InvalidRequest("invalid page token".into());
        let (encoded, signature) = token.split_once('.').ok_or_else(invalid)?;
        let data = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| invalid())?;
        let expected = self.sign(&data);
        // Constant-time comparison
        let matches = expected.len() == signature.len()
            && expected
                .bytes()
                .zip(signature.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if !matches {
            return Err(invalid());
        }
        serde_json::from_slice(&data).map_err(|_| invalid())
    }
}
