// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RO-Crate metadata generation (`ro-crate-metadata.json`).
//!
//! Builds a Workflow Run Crate describing the workflow document, staged
//! inputs, produced outputs, the engine, timestamps, exit code, and the
//! container image. Generation failure is non-fatal: the file then carries
//! `{"@error": "<reason>"}` so readers can tell a failed build from an
//! absent one.

use std::path::Path;

use anyhow::{Context, Result};
use sapporo_wes::run_store::RunDirEntry;
use sapporo_wes::schemas::RunRequest;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const CRATE_CONTEXT: &str = "https://w3id.org/ro/crate/1.1/context";
const PROCESS_PROFILE: &str = "https://w3id.org/ro/wfrun/process/0.1";
const WORKFLOW_PROFILE: &str = "https://w3id.org/ro/wfrun/workflow/0.1";

/// Generate `ro-crate-metadata.json` for a finished run. Any failure is
/// captured into the file itself.
pub async fn generate(run_dir: &Path) -> Result<()> {
    let metadata = match build(run_dir).await {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(error = %e, "RO-Crate generation failed");
            json!({"@error": e.to_string()})
        }
    };
    let path = run_dir.join(RunDirEntry::RoCrate.rel_path());
    tokio::fs::write(&path, serde_json::to_vec_pretty(&metadata)?)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

async fn build(run_dir: &Path) -> Result<Value> {
    let run_id = crate::outputs::run_id_of(run_dir)?;
    let request = read_request(run_dir).await?;

    let start_time = read_trimmed(run_dir, RunDirEntry::StartTime).await;
    let end_time = read_trimmed(run_dir, RunDirEntry::EndTime).await;
    let exit_code = read_trimmed(run_dir, RunDirEntry::ExitCode)
        .await
        .and_then(|s| s.parse::<i32>().ok());
    let cmd = read_trimmed(run_dir, RunDirEntry::Cmd).await;
    let container_image = cmd.as_deref().and_then(image_from_cmd);

    let mut graph = Vec::new();
    graph.push(json!({
        "@id": "ro-crate-metadata.json",
        "@type": "CreativeWork",
        "about": {"@id": "./"},
        "conformsTo": [
            {"@id": "https://w3id.org/ro/crate/1.1"},
            {"@id": PROCESS_PROFILE},
            {"@id": WORKFLOW_PROFILE},
        ],
    }));

    let input_files = file_entities(run_dir, RunDirEntry::ExeDir.rel_path()).await?;
    let output_files = file_entities(run_dir, RunDirEntry::OutputsDir.rel_path()).await?;

    let mut has_part: Vec<Value> = Vec::new();
    for entity in input_files.iter().chain(output_files.iter()) {
        has_part.push(json!({"@id": entity["@id"]}));
    }

    graph.push(json!({
        "@id": "./",
        "@type": "Dataset",
        "name": format!("Workflow run {run_id}"),
        "conformsTo": [
            {"@id": PROCESS_PROFILE},
            {"@id": WORKFLOW_PROFILE},
        ],
        "hasPart": has_part,
        "mainEntity": {"@id": request.workflow_url},
        "mentions": {"@id": format!("#run-{run_id}")},
    }));

    graph.push(json!({
        "@id": request.workflow_url,
        "@type": ["File", "SoftwareSourceCode", "ComputationalWorkflow"],
        "name": request.workflow_url,
        "programmingLanguage": {"@id": format!("#{}", request.workflow_type)},
    }));
    graph.push(json!({
        "@id": format!("#{}", request.workflow_type),
        "@type": "ComputerLanguage",
        "name": request.workflow_type,
        "version": request.workflow_type_version,
    }));

    let mut engine = json!({
        "@id": format!("#{}", request.workflow_engine),
        "@type": "SoftwareApplication",
        "name": request.workflow_engine,
    });
    if let Some(version) = &request.workflow_engine_version {
        engine["softwareVersion"] = json!(version);
    }
    if let Some(image) = &container_image {
        engine["containerImage"] = json!(image);
    }
    graph.push(engine);

    let mut action = json!({
        "@id": format!("#run-{run_id}"),
        "@type": "CreateAction",
        "name": format!("Execution of {}", request.workflow_url),
        "instrument": {"@id": format!("#{}", request.workflow_engine)},
        "object": input_files.iter().map(|e| json!({"@id": e["@id"]})).collect::<Vec<_>>(),
        "result": output_files.iter().map(|e| json!({"@id": e["@id"]})).collect::<Vec<_>>(),
    });
    if let Some(start) = &start_time {
        action["startTime"] = json!(start);
    }
    if let Some(end) = &end_time {
        action["endTime"] = json!(end);
    }
    if let Some(code) = exit_code {
        action["exitCode"] = json!(code);
        action["actionStatus"] = json!(if code == 0 {
            "http://schema.org/CompletedActionStatus"
        } else {
            "http://schema.org/FailedActionStatus"
        });
    }
    graph.push(action);

    graph.extend(input_files);
    graph.extend(output_files);

    Ok(json!({
        "@context": CRATE_CONTEXT,
        "@graph": graph,
    }))
}

async fn read_request(run_dir: &Path) -> Result<RunRequest> {
    let path = run_dir.join(RunDirEntry::RunRequest.rel_path());
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).context("invalid run_request.json")
}

async fn read_trimmed(run_dir: &Path, entry: RunDirEntry) -> Option<String> {
    tokio::fs::read_to_string(run_dir.join(entry.rel_path()))
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pull the image name out of a recorded `docker run ...` command line.
fn image_from_cmd(cmd: &str) -> Option<String> {
    let tokens: Vec<&str> = cmd.split_whitespace().collect();
    if tokens.first() != Some(&"docker") {
        return None;
    }
    let run_pos = tokens.iter().position(|t| *t == "run")?;
    // First token after `run` that is neither a flag nor a flag value
    let mut skip_value = false;
    for token in &tokens[run_pos + 1..] {
        if skip_value {
            skip_value = false;
            continue;
        }
        if token.starts_with('-') {
            // Flags with separate values
            skip_value = matches!(
                *token,
                "-v" | "--volume" | "-w" | "--workdir" | "-e" | "--env" | "--name" | "-u"
                    | "--user" | "--entrypoint" | "--network"
            );
            continue;
        }
        return Some((*token).to_string());
    }
    None
}

/// File entities (with size and sha256) for every file under `subdir`.
async fn file_entities(run_dir: &Path, subdir: &str) -> Result<Vec<Value>> {
    let root = run_dir.join(subdir);
    let mut rels = Vec::new();
    collect(&root, &root, &mut rels)?;
    rels.sort();

    let mut entities = Vec::with_capacity(rels.len());
    for rel in rels {
        let path = root.join(&rel);
        let bytes = tokio::fs::read(&path).await?;
        let digest = Sha256::digest(&bytes);
        entities.push(json!({
            "@id": format!("{subdir}/{rel}"),
            "@type": "File",
            "name": rel,
            "contentSize": bytes.len(),
            "sha256": format!("{digest:x}"),
        }));
    }
    Ok(entities)
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ab").join("abcd-1234");
        std::fs::create_dir_all(dir.join("exe")).unwrap();
        std::fs::create_dir_all(dir.join("outputs")).unwrap();
        std::fs::write(
            dir.join("run_request.json"),
            serde_json::json!({
                "workflow_params": {"input": "data.txt"},
                "workflow_type": "CWL",
                "workflow_type_version": "v1.2",
                "workflow_engine": "cwltool",
                "workflow_engine_version": "3.1",
                "workflow_url": "https://example.com/wf.cwl"
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(dir.join("start_time.txt"), "2024-01-01T00:00:00Z").unwrap();
        std::fs::write(dir.join("end_time.txt"), "2024-01-01T01:00:00Z").unwrap();
        std::fs::write(dir.join("exit_code.txt"), "0").unwrap();
        std::fs::write(
            dir.join("cmd.txt"),
            "docker run --rm -v /runs:/runs quay.io/commonwl/cwltool:3.1 wf.cwl",
        )
        .unwrap();
        std::fs::write(dir.join("exe/workflow_params.json"), "{}").unwrap();
        std::fs::write(dir.join("outputs/result.txt"), "result").unwrap();
        (tmp, dir)
    }

    #[tokio::test]
    async fn test_generate_full_crate() {
        let (_tmp, dir) = fixture();
        generate(&dir).await.unwrap();

        let content = std::fs::read_to_string(dir.join("ro-crate-metadata.json")).unwrap();
        let crate_doc: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(crate_doc["@context"], CRATE_CONTEXT);

        let graph = crate_doc["@graph"].as_array().unwrap();
        let action = graph
            .iter()
            .find(|e| e["@type"] == "CreateAction")
            .unwrap();
        assert_eq!(action["startTime"], "2024-01-01T00:00:00Z");
        assert_eq!(action["endTime"], "2024-01-01T01:00:00Z");
        assert_eq!(action["exitCode"], 0);
        assert_eq!(action["actionStatus"], "http://schema.org/CompletedActionStatus");

        let engine = graph.iter().find(|e| e["@id"] == "#cwltool").unwrap();
        assert_eq!(engine["softwareVersion"], "3.1");
        assert_eq!(engine["containerImage"], "quay.io/commonwl/cwltool:3.1");

        let output = graph
            .iter()
            .find(|e| e["@id"] == "outputs/result.txt")
            .unwrap();
        assert_eq!(output["contentSize"], 6);
        assert!(output["sha256"].as_str().unwrap().len() == 64);
    }

    #[tokio::test]
    async fn test_failure_writes_error_marker() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("ab").join("broken-run");
        std::fs::create_dir_all(&dir).unwrap();
        // No run_request.json: the build fails, the file still appears
        generate(&dir).await.unwrap();

        let content = std::fs::read_to_string(dir.join("ro-crate-metadata.json")).unwrap();
        let doc: Value = serde_json::from_str(&content).unwrap();
        assert!(doc.get("@error").is_some());
    }

    #[test]
    fn test_image_from_cmd() {
        assert_eq!(
            image_from_cmd("docker run --rm -v /a:/a -e X=1 myimage:1.0 arg"),
            Some("myimage:1.0".to_string())
        );
        assert_eq!(image_from_cmd("bash run.sh /runs"), None);
    }
}
