// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output manifest generation (`outputs.json`).

use std::path::Path;

use anyhow::{Context, Result};
use sapporo_wes::run_store::RunDirEntry;
use sapporo_wes::schemas::FileObject;

/// Walk `outputs/` and write the `outputs.json` manifest.
///
/// File names are relative to `outputs/` with forward slashes; URLs point
/// back at the service's outputs endpoint for this run.
pub async fn dump_outputs(run_dir: &Path) -> Result<()> {
    let run_id = run_id_of(run_dir)?;
    let base_url = read_base_url(run_dir).await?;
    let outputs_dir = run_dir.join(RunDirEntry::OutputsDir.rel_path());

    let mut files = Vec::new();
    collect(&outputs_dir, &outputs_dir, &mut files)?;
    files.sort();

    let manifest: Vec<FileObject> = files
        .into_iter()
        .map(|rel| FileObject {
            file_url: format!("{base_url}/runs/{run_id}/outputs/{rel}"),
            file_name: rel,
        })
        .collect();

    let path = run_dir.join(RunDirEntry::Outputs.rel_path());
    tokio::fs::write(&path, serde_json::to_vec_pretty(&manifest)?)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(count = manifest.len(), "outputs manifest written");
    Ok(())
}

pub fn run_id_of(run_dir: &Path) -> Result<String> {
    run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("run directory has no name")
}

/// The service base URL captured into `sapporo_config.json` at submit time.
pub async fn read_base_url(run_dir: &Path) -> Result<String> {
    let path = run_dir.join(RunDirEntry::SapporoConfig.rel_path());
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: serde_json::Value = serde_json::from_str(&content)?;
    config
        .get("base_url")
        .and_then(|v| v.as_str())
        .map(|s| s.trim_end_matches('/').to_string())
        .context("sapporo_config.json has no base_url")
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else if path.is_file()
            && let Ok(rel) = path.strip_prefix(root)
        {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Read the manifest back, if present.
pub fn read_manifest(run_dir: &Path) -> Option<Vec<FileObject>> {
    let content = std::fs::read_to_string(run_dir.join(RunDirEntry::Outputs.rel_path())).ok()?;
    serde_json::from_str(&content).ok()
}
