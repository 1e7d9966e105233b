// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types for the WES HTTP surface.
//!
//! Field sets follow GA4GH WES 1.1 with the sapporo-wes-2.0.0 extensions
//! (`workflow_params` as object-or-string, `outputs` as a list of
//! [`FileObject`]s, the `DELETING`/`DELETED` states).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::State;

/// A named file reachable through the service.
///
/// `file_name` is a relative path (forward slashes, no `..` segment and no
/// leading `/`). `file_url` is either an absolute `http(s)` URL or resolves
/// within the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObject {
    pub file_name: String,
    pub file_url: String,
}

/// The validated, immutable request that created a run.
///
/// Persisted verbatim as `run_request.json`; returned inside `RunLog`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Parsed JSON object, or the raw string when the client sent a string.
    pub workflow_params: Option<Value>,
    pub workflow_type: String,
    pub workflow_type_version: String,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
    pub workflow_engine: String,
    /// Advisory only; recorded but never enforced against the engine.
    #[serde(default)]
    pub workflow_engine_version: Option<String>,
    #[serde(default)]
    pub workflow_engine_parameters: Option<HashMap<String, String>>,
    pub workflow_url: String,
    /// Remote attachments to be staged into `exe/` by the dispatcher.
    #[serde(default)]
    pub workflow_attachment_obj: Vec<FileObject>,
}

impl RunRequest {
    pub fn tags_or_empty(&self) -> HashMap<String, String> {
        self.tags.clone().unwrap_or_default()
    }
}

/// `POST /runs` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunId {
    pub run_id: String,
}

/// `GET /runs/{run_id}/status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: State,
}

/// One row of `GET /runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub state: State,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub tags: HashMap<String, String>,
}

/// `GET /runs` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunSummary>,
    pub next_page_token: Option<String>,
    pub total_runs: u64,
}

/// Process-level log block inside `RunLog`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
    pub name: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub system_logs: Option<Vec<String>>,
}

/// `GET /runs/{run_id}` response, reconstructed entirely from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub request: Option<RunRequest>,
    pub state: State,
    pub run_log: Log,
    pub task_logs_url: Option<String>,
    pub task_logs: Option<Vec<Log>>,
    pub outputs: Option<Vec<FileObject>>,
}

/// `GET /runs/{run_id}/outputs` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsListResponse {
    pub outputs: Vec<FileObject>,
}

/// The executable-workflows whitelist document. An empty list means no
/// restriction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutableWorkflows {
    pub workflows: Vec<String>,
}

/// Uniform error body returned on every 4xx/5xx.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub msg: String,
    pub status_code: u16,
}

/// `POST /token` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// `GET /me` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeResponse {
    pub username: String,
}

/// GA4GH service-info organization block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub url: String,
}

/// GA4GH service-info type block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceType {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTypeVersion {
    #[serde(default)]
    pub workflow_type_version: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowEngineVersion {
    #[serde(default)]
    pub workflow_engine_version: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultWorkflowEngineParameter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub param_type: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

/// `GET /service-info` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub description: Option<String>,
    pub organization: Organization,
    #[serde(rename = "contactUrl")]
    pub contact_url: Option<String>,
    #[serde(rename = "documentationUrl")]
    pub documentation_url: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<String>,
    pub environment: Option<String>,
    pub version: String,
    pub workflow_type_versions: HashMap<String, WorkflowTypeVersion>,
    pub supported_wes_versions: Vec<String>,
    pub supported_filesystem_protocols: Vec<String>,
    pub workflow_engine_versions: HashMap<String, WorkflowEngineVersion>,
    pub default_workflow_engine_parameters:
        HashMap<String, Vec<DefaultWorkflowEngineParameter>>,
    pub system_state_counts: HashMap<String, u64>,
    pub auth_instructions_url: String,
    pub tags: HashMap<String, String>,
}
