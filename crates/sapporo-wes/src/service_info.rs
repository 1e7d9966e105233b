// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loading of `service-info.json` and `executable-workflows.json`.
//!
//! The service-info file is operator-authored and may be sparse; missing
//! fields fall back to the defaults below. `system_state_counts` is always
//! overwritten at request time from the index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{AppError, Result};
use crate::schemas::{
    DefaultWorkflowEngineParameter, ExecutableWorkflows, Organization, ServiceInfo, ServiceType,
    WorkflowEngineVersion, WorkflowTypeVersion,
};

const WES_SPEC_VERSION: &str = "sapporo-wes-2.0.0";

/// Source paths for the operator-provided documents.
#[derive(Debug, Clone)]
pub struct ServiceInfoSource {
    service_info_path: PathBuf,
    executable_workflows_path: PathBuf,
}

impl ServiceInfoSource {
    pub fn new(service_info: impl Into<PathBuf>, executable_workflows: impl Into<PathBuf>) -> Self {
        Self {
            service_info_path: service_info.into(),
            executable_workflows_path: executable_workflows.into(),
        }
    }

    /// Load service-info, filling defaults for absent fields.
    pub fn load_service_info(&self) -> Result<ServiceInfo> {
        let file: Value = read_json(&self.service_info_path)?;

        let get_str = |key: &str, default: &str| -> String {
            file.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let get_opt = |key: &str| -> Option<String> {
            file.get(key).and_then(Value::as_str).map(str::to_string)
        };

        let workflow_type_versions: HashMap<String, WorkflowTypeVersion> =
            parse_section(&file, "workflow_type_versions")?;
        let workflow_engine_versions: HashMap<String, WorkflowEngineVersion> =
            parse_section(&file, "workflow_engine_versions")?;
        let default_workflow_engine_parameters: HashMap<
            String,
            Vec<DefaultWorkflowEngineParameter>,
        > = parse_section(&file, "default_workflow_engine_parameters")?;
        let tags: HashMap<String, String> = parse_section(&file, "tags")?;

        let type_block = file.get("type").cloned().unwrap_or(Value::Null);
        let org_block = file.get("organization").cloned().unwrap_or(Value::Null);

        Ok(ServiceInfo {
            id: get_str("id", "sapporo-service"),
            name: get_str("name", "sapporo-service"),
            service_type: ServiceType {
                group: str_in(&type_block, "group", "sapporo-wes"),
                artifact: str_in(&type_block, "artifact", "wes"),
                version: str_in(&type_block, "version", WES_SPEC_VERSION),
            },
            description: get_opt("description")
                .or_else(|| Some("An instance of sapporo-wes.".to_string())),
            organization: Organization {
                name: str_in(&org_block, "name", "Sapporo-WES Project Team"),
                url: str_in(
                    &org_block,
                    "url",
                    "https://github.com/orgs/sapporo-wes/people",
                ),
            },
            contact_url: get_opt("contactUrl"),
            documentation_url: get_opt("documentationUrl"),
            created_at: get_opt("createdAt"),
            updated_at: get_opt("updatedAt"),
            environment: get_opt("environment"),
            version: get_str("version", env!("CARGO_PKG_VERSION")),
            workflow_type_versions,
            supported_wes_versions: file
                .get("supported_wes_versions")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_else(|| vec![WES_SPEC_VERSION.to_string()]),
            supported_filesystem_protocols: file
                .get("supported_filesystem_protocols")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_else(|| {
                    vec!["http".to_string(), "https".to_string(), "file".to_string()]
                }),
            workflow_engine_versions,
            default_workflow_engine_parameters,
            system_state_counts: HashMap::new(),
            auth_instructions_url: get_str(
                "auth_instructions_url",
                "https://github.com/sapporo-wes/sapporo-service#authentication",
            ),
            tags,
        })
    }

    /// Load the executable-workflow whitelist. A missing file means no
    /// restriction.
    pub fn load_executable_workflows(&self) -> Result<ExecutableWorkflows> {
        if !self.executable_workflows_path.exists() {
            return Ok(ExecutableWorkflows::default());
        }
        let value: Value = read_json(&self.executable_workflows_path)?;
        serde_json::from_value(value).map_err(|e| {
            AppError::Internal(format!(
                "invalid executable-workflows file {}: {e}",
                self.executable_workflows_path.display()
            ))
        })
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Internal(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| AppError::Internal(format!("invalid JSON in {}: {e}", path.display())))
}

fn parse_section<T: serde::de::DeserializeOwned + Default>(file: &Value, key: &str) -> Result<T> {
    match file.get(key) {
        Some(section) => serde_json::from_value(section.clone())
            .map_err(|e| AppError::Internal(format!("invalid `{key}` in service-info: {e}"))),
        None => Ok(T::default()),
    }
}

fn str_in(block: &Value, key: &str, default: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_sparse_service_info_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let si = write_file(
            &dir,
            "service-info.json",
            r#"{"workflow_engine_versions": {"cwltool": {"workflow_engine_version": ["3.1"]}}}"#,
        );
        let source = ServiceInfoSource::new(&si, dir.path().join("missing.json"));
        let info = source.load_service_info().unwrap();
        assert_eq!(info.id, "sapporo-service");
        assert_eq!(info.service_type.artifact, "wes");
        assert!(info.workflow_engine_versions.contains_key("cwltool"));
        assert!(info.system_state_counts.is_empty());
    }

    #[test]
    fn test_explicit_fields_win() {
        let dir = TempDir::new().unwrap();
        let si = write_file(
            &dir,
            "service-info.json",
            r#"{"id": "my-wes", "version": "9.9.9", "tags": {"cap": "none"}}"#,
        );
        let source = ServiceInfoSource::new(&si, dir.path().join("missing.json"));
        let info = source.load_service_info().unwrap();
        assert_eq!(info.id, "my-wes");
        assert_eq!(info.version, "9.9.9");
        assert_eq!(info.tags.get("cap").map(String::as_str), Some("none"));
    }

    #[test]
    fn test_missing_whitelist_means_unrestricted() {
        let dir = TempDir::new().unwrap();
        let si = write_file(&dir, "service-info.json", "{}");
        let source = ServiceInfoSource::new(&si, dir.path().join("absent.json"));
        let wfs = source.load_executable_workflows().unwrap();
        assert!(wfs.workflows.is_empty());
    }

    #[test]
    fn test_whitelist_loads() {
        let dir = TempDir::new().unwrap();
        let si = write_file(&dir, "service-info.json", "{}");
        let ex = write_file(
            &dir,
            "executable-workflows.json",
            r#"{"workflows": ["https://ex/wf.cwl"]}"#,
        );
        let source = ServiceInfoSource::new(&si, &ex);
        let wfs = source.load_executable_workflows().unwrap();
        assert_eq!(wfs.workflows, vec!["https://ex/wf.cwl"]);
    }
}
