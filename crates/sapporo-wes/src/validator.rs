// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation of `POST /runs` requests.
//!
//! Requests arrive either as `multipart/form-data` (fields possibly
//! JSON-encoded strings) or as `application/json`; both are lowered into
//! [`RawRunRequest`] by the router and unified here into a canonical
//! [`RunRequest`] plus staged attachments, or a structured 400.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{AppError, Result};
use crate::run_store::StagedAttachment;
use crate::schemas::{
    DefaultWorkflowEngineParameter, ExecutableWorkflows, FileObject, RunRequest, ServiceInfo,
};
use crate::secure_path::secure_filepath;

/// Characters refused in any string the dispatcher shell evaluates.
const PROHIBITED_CHARS: &[char] = &[
    ';', '!', '?', '(', ')', '[', ']', '{', '}', '*', '\\', '&', '`', '^', '<', '>', '|', '$',
];

/// Engine/type compatibility: which workflow types each engine accepts.
fn accepted_types(engine: &str) -> &'static [&'static str] {
    match engine {
        "cwltool" | "toil" | "ep3" | "streamflow" => &["CWL"],
        "cromwell" => &["WDL"],
        "nextflow" => &["NFL"],
        "snakemake" => &["SMK"],
        _ => &[],
    }
}

/// An uploaded file as received from the multipart stream.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Form fields before validation. Every field may still be a JSON-encoded
/// string at this point.
#[derive(Debug, Clone, Default)]
pub struct RawRunRequest {
    pub workflow_params: Option<Value>,
    pub workflow_type: Option<String>,
    pub workflow_type_version: Option<String>,
    pub tags: Option<Value>,
    pub workflow_engine: Option<String>,
    pub workflow_engine_version: Option<String>,
    pub workflow_engine_parameters: Option<Value>,
    pub workflow_url: Option<String>,
    pub workflow_attachment: Vec<UploadedFile>,
    pub workflow_attachment_obj: Option<Value>,
}

impl RawRunRequest {
    /// Lower an `application/json` body into the shared raw form.
    pub fn from_json(body: Value) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| AppError::InvalidRequest("request body must be a JSON object".into()))?
            .clone();
        let get_string = |key: &str| -> Result<Option<String>> {
            match obj.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(AppError::InvalidRequest(format!("`{key}` must be a string"))),
            }
        };
        Ok(Self {
            workflow_params: obj.get("workflow_params").cloned().filter(|v| !v.is_null()),
            workflow_type: get_string("workflow_type")?,
            workflow_type_version: get_string("workflow_type_version")?,
            tags: obj.get("tags").cloned().filter(|v| !v.is_null()),
            workflow_engine: get_string("workflow_engine")?,
            workflow_engine_version: get_string("workflow_engine_version")?,
            workflow_engine_parameters: obj
                .get("workflow_engine_parameters")
                .cloned()
                .filter(|v| !v.is_null()),
            workflow_url: get_string("workflow_url")?,
            workflow_attachment: Vec::new(),
            workflow_attachment_obj: obj
                .get("workflow_attachment_obj")
                .or_else(|| obj.get("workflow_attachment"))
                .cloned()
                .filter(|v| !v.is_null()),
        })
    }
}

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedRun {
    pub run_request: RunRequest,
    pub engine_params: String,
    pub attachments: Vec<StagedAttachment>,
}

/// Validate and canonicalize a run request.
pub fn validate_run_request(
    raw: RawRunRequest,
    service_info: &ServiceInfo,
    executable_workflows: &ExecutableWorkflows,
) -> Result<ValidatedRun> {
    let workflow_engine = raw
        .workflow_engine
        .clone()
        .ok_or_else(|| AppError::InvalidRequest("`workflow_engine` is required".into()))?;
    if !service_info
        .workflow_engine_versions
        .contains_key(&workflow_engine)
    {
        return Err(AppError::InvalidRequest(format!(
            "workflow engine `{workflow_engine}` is not supported"
        )));
    }

    let workflow_type = raw
        .workflow_type
        .clone()
        .ok_or_else(|| AppError::InvalidRequest("`workflow_type` is required".into()))?;
    let accepted = accepted_types(&workflow_engine);
    if !accepted.contains(&workflow_type.as_str()) {
        return Err(AppError::InvalidRequest(format!(
            "workflow engine `{workflow_engine}` does not accept workflow type `{workflow_type}`"
        )));
    }

    let workflow_type_version = raw
        .workflow_type_version
        .clone()
        .ok_or_else(|| AppError::InvalidRequest("`workflow_type_version` is required".into()))?;
    let known_versions = service_info
        .workflow_type_versions
        .get(&workflow_type)
        .map(|v| v.workflow_type_version.clone())
        .unwrap_or_default();
    if !known_versions.is_empty() && !known_versions.contains(&workflow_type_version) {
        return Err(AppError::InvalidRequest(format!(
            "invalid `workflow_type_version` `{workflow_type_version}` for workflow type `{workflow_type}`"
        )));
    }

    let attachments = stage_attachments(&raw.workflow_attachment)?;
    let workflow_attachment_obj = parse_attachment_obj(raw.workflow_attachment_obj.clone())?;

    let workflow_url = match raw.workflow_url.clone() {
        Some(url) => url,
        // A single attachment can stand in for the workflow document.
        None if attachments.len() == 1 => {
            attachments[0].path.to_string_lossy().replace('\\', "/")
        }
        None => {
            return Err(AppError::InvalidRequest("`workflow_url` is required".into()));
        }
    };

    check_meta_characters("workflow_url", &workflow_url)?;
    check_meta_characters("workflow_engine", &workflow_engine)?;

    enforce_whitelist(&workflow_url, executable_workflows)?;

    let workflow_params = canonicalize_params(raw.workflow_params.clone());
    let tags = parse_string_map("tags", raw.tags.clone())?;
    let workflow_engine_parameters =
        parse_string_map("workflow_engine_parameters", raw.workflow_engine_parameters.clone())?;
    if let Some(params) = &workflow_engine_parameters {
        for (key, value) in params {
            check_meta_characters("workflow_engine_parameters", key)?;
            check_meta_characters("workflow_engine_parameters", value)?;
        }
    }

    let engine_params = assemble_engine_params(
        workflow_engine_parameters.as_ref(),
        &workflow_engine,
        &service_info.default_workflow_engine_parameters,
    );

    Ok(ValidatedRun {
        run_request: RunRequest {
            workflow_params,
            workflow_type,
            workflow_type_version,
            tags,
            workflow_engine,
            workflow_engine_version: raw.workflow_engine_version,
            workflow_engine_parameters,
            workflow_url,
            workflow_attachment_obj,
        },
        engine_params,
        attachments,
    })
}

/// Sanitize uploaded attachment names. A name that sanitization would alter
/// is a policy violation, not something to silently fix.
fn stage_attachments(uploads: &[UploadedFile]) -> Result<Vec<StagedAttachment>> {
    let mut staged = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let path = checked_file_name(&upload.file_name)?;
        staged.push(StagedAttachment {
            path,
            bytes: upload.bytes.clone(),
        });
    }
    Ok(staged)
}

fn checked_file_name(name: &str) -> Result<std::path::PathBuf> {
    let sanitized = secure_filepath(name);
    let normalized = name.trim_start_matches("./").replace('\\', "/");
    if sanitized.as_os_str().is_empty() || sanitized.to_string_lossy() != normalized {
        return Err(AppError::InvalidRequest(format!(
            "invalid attachment file_name: `{name}`"
        )));
    }
    Ok(sanitized)
}

fn parse_attachment_obj(value: Option<Value>) -> Result<Vec<FileObject>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let value = destring(value)?;
    let files: Vec<FileObject> = serde_json::from_value(value).map_err(|_| {
        AppError::InvalidRequest(
            "`workflow_attachment_obj` must be a list of {file_name, file_url}".into(),
        )
    })?;
    for file in &files {
        checked_file_name(&file.file_name)?;
    }
    Ok(files)
}

/// Whitelist enforcement: when the set is non-empty, only exact matches of
/// absolute http(s) entries are runnable.
fn enforce_whitelist(workflow_url: &str, executable: &ExecutableWorkflows) -> Result<()> {
    if executable.workflows.is_empty() {
        return Ok(());
    }
    let is_absolute =
        workflow_url.starts_with("http://") || workflow_url.starts_with("https://");
    if !is_absolute || !executable.workflows.iter().any(|w| w == workflow_url) {
        return Err(AppError::InvalidRequest(
            "workflow_url not in executable workflows".into(),
        ));
    }
    Ok(())
}

/// `workflow_params` keeps its dual form: a JSON string that parses to a
/// structure is canonicalized to that structure, any other string stays
/// opaque (some engines take non-JSON parameter files).
fn canonicalize_params(value: Option<Value>) -> Option<Value> {
    match value {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) if parsed.is_object() || parsed.is_array() => Some(parsed),
            _ => Some(Value::String(s)),
        },
        other => other,
    }
}

/// Parse a `string -> string` mapping that may itself arrive JSON-encoded.
fn parse_string_map(
    field: &str,
    value: Option<Value>,
) -> Result<Option<HashMap<String, String>>> {
    let Some(value) = value else { return Ok(None) };
    let value = destring(value)?;
    let obj = value.as_object().ok_or_else(|| {
        AppError::InvalidRequest(format!("`{field}` must be an object of strings"))
    })?;
    let mut map = HashMap::with_capacity(obj.len());
    for (key, val) in obj {
        let val = match val {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                return Err(AppError::InvalidRequest(format!(
                    "`{field}` values must be strings"
                )));
            }
        };
        map.insert(key.clone(), val);
    }
    Ok(Some(map))
}

/// Unwrap one level of JSON-string encoding, as multipart fields carry.
fn destring(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => serde_json::from_str(&s)
            .map_err(|_| AppError::InvalidRequest(format!("`{s}` is not valid JSON"))),
        other => Ok(other),
    }
}

fn check_meta_characters(field: &str, content: &str) -> Result<()> {
    if let Some(bad) = content.chars().find(|c| PROHIBITED_CHARS.contains(c)) {
        return Err(AppError::InvalidRequest(format!(
            "`{field}` contains a prohibited character `{bad}`"
        )));
    }
    Ok(())
}

/// Flatten engine parameters into the single line the dispatcher consumes.
/// Falls back to the engine's defaults from service-info when the request
/// carries none.
fn assemble_engine_params(
    request_params: Option<&HashMap<String, String>>,
    engine: &str,
    defaults: &HashMap<String, Vec<DefaultWorkflowEngineParameter>>,
) -> String {
    match request_params {
        Some(params) => {
            let mut pairs: Vec<(&String, &String)> = params.iter().collect();
            pairs.sort();
            pairs
                .iter()
                .flat_map(|(k, v)| [k.as_str(), v.as_str()])
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        }
        None => defaults
            .get(engine)
            .map(|list| {
                list.iter()
                    .flat_map(|p| {
                        [
                            p.name.clone().unwrap_or_default(),
                            p.default_value.clone().unwrap_or_default(),
                        ]
                    })
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default(),
    }
}
