// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging of remote workflow attachments into `exe/`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sapporo_wes::run_store::RunDirEntry;
use sapporo_wes::schemas::RunRequest;
use sapporo_wes::secure_path::secure_filepath;
use tracing::{info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

/// Download every `workflow_attachment_obj` entry into `exe/`.
///
/// URLs pointing back at this service are skipped: those files were already
/// staged by the service at submit time.
pub async fn download_attachments(run_dir: &Path) -> Result<()> {
    let request_path = run_dir.join(RunDirEntry::RunRequest.rel_path());
    let content = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("failed to read {}", request_path.display()))?;
    let request: RunRequest = serde_json::from_str(&content).context("invalid run_request.json")?;

    if request.workflow_attachment_obj.is_empty() {
        return Ok(());
    }

    let base_url = crate::outputs::read_base_url(run_dir).await.unwrap_or_default();
    let exe_dir = run_dir.join(RunDirEntry::ExeDir.rel_path());
    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

    for attachment in &request.workflow_attachment_obj {
        let url = &attachment.file_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            warn!(url = %url, "skipping non-http attachment url");
            continue;
        }
        if !base_url.is_empty() && url.starts_with(&base_url) {
            continue;
        }
        let rel = secure_filepath(&attachment.file_name);
        if rel.as_os_str().is_empty() {
            bail!("attachment file_name sanitizes to nothing: {}", attachment.file_name);
        }
        let target = exe_dir.join(&rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = fetch_with_retry(&client, url).await?;
        tokio::fs::write(&target, &bytes)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        info!(url = %url, target = %target.display(), size = bytes.len(), "attachment staged");
    }
    Ok(())
}

async fn fetch_with_retry(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let mut last_error = String::new();
    for (attempt, backoff) in RETRY_BACKOFF.iter().enumerate() {
        match client.get(url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.bytes().await {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
        warn!(url = %url, attempt = attempt + 1, error = %last_error, "attachment fetch failed");
        tokio::time::sleep(*backoff).await;
    }
    bail!("failed to fetch {url} after {} attempts: {last_error}", RETRY_BACKOFF.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_no_attachments_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ab").join("r1");
        std::fs::create_dir_all(dir.join("exe")).unwrap();
        std::fs::write(
            dir.join("run_request.json"),
            serde_json::json!({
                "workflow_params": null,
                "workflow_type": "CWL",
                "workflow_type_version": "v1.2",
                "workflow_engine": "cwltool",
                "workflow_url": "wf.cwl"
            })
            .to_string(),
        )
        .unwrap();
        download_attachments(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_request_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(download_attachments(tmp.path()).await.is_err());
    }
}
