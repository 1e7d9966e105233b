// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the HTTP surface against a temp-directory run store.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use sapporo_wes::config::{AppConfig, AuthConfig, AuthUser, IdpProvider, SapporoAuthConfig};
use sapporo_wes::db::Index;
use sapporo_wes::indexer::{Indexer, IndexerConfig};
use sapporo_wes::run_store::{RunDirEntry, RunStore};
use sapporo_wes::server::{AppState, router};

struct TestService {
    _tmp: TempDir,
    app: Router,
    store: RunStore,
    indexer: Indexer,
}

async fn service_with(auth: AuthConfig, whitelist: &str) -> TestService {
    let tmp = TempDir::new().unwrap();
    let run_dir = tmp.path().join("runs");
    std::fs::create_dir_all(&run_dir).unwrap();

    let service_info = tmp.path().join("service-info.json");
    std::fs::write(
        &service_info,
        json!({
            "workflow_type_versions": {
                "CWL": {"workflow_type_version": ["v1.0", "v1.2"]},
                "NFL": {"workflow_type_version": ["DSL2"]},
                "WDL": {"workflow_type_version": ["1.0"]},
                "SMK": {"workflow_type_version": ["1.0"]}
            },
            "workflow_engine_versions": {
                "cwltool": {"workflow_engine_version": ["3.1"]},
                "nextflow": {"workflow_engine_version": ["24.04.4"]},
                "cromwell": {"workflow_engine_version": ["87"]},
                "snakemake": {"workflow_engine_version": ["8.16.0"]}
            }
        })
        .to_string(),
    )
    .unwrap();

    let executable_workflows = tmp.path().join("executable-workflows.json");
    std::fs::write(&executable_workflows, whitelist).unwrap();

    let run_sh = tmp.path().join("run.sh");
    std::fs::write(&run_sh, "#!/bin/bash\nexit 0\n").unwrap();
    std::fs::set_permissions(&run_sh, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = AppConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        debug: false,
        run_dir: run_dir.clone(),
        service_info,
        executable_workflows,
        run_sh,
        url_prefix: String::new(),
        base_url: "http://localhost:1122".to_string(),
        allow_origin: "*".to_string(),
        run_remove_older_than_days: None,
        snapshot_interval_mins: 30,
        auth,
    };

    let index = Arc::new(Index::open(&run_dir).await.unwrap());
    let store = RunStore::new(&run_dir);
    let indexer = Indexer::new(
        store.clone(),
        index.clone(),
        IndexerConfig {
            interval: Duration::from_secs(3600),
            remove_older_than_days: None,
        },
    );
    let state = AppState::new(config, index).await.unwrap();
    let app = router(state);

    TestService {
        _tmp: tmp,
        app,
        store,
        indexer,
    }
}

async fn service() -> TestService {
    service_with(AuthConfig::disabled(), r#"{"workflows": []}"#).await
}

fn local_auth(users: &[(&str, &str)]) -> AuthConfig {
    use argon2::password_hash::SaltString;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::{Argon2, PasswordHasher};

    AuthConfig {
        auth_enabled: true,
        idp_provider: IdpProvider::Sapporo,
        sapporo_auth_config: Some(SapporoAuthConfig {
            secret_key: "q8Fz3mWx1bKpT7vRd9LhYc2NgAe5UjSo".to_string(),
            expires_delta_hours: Some(24),
            users: users
                .iter()
                .map(|(name, password)| AuthUser {
                    username: name.to_string(),
                    password_hash: Argon2::default()
                        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))
                        .unwrap()
                        .to_string(),
                })
                .collect(),
        }),
        external_config: None,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn cwl_request() -> Value {
    json!({
        "workflow_params": {"input": "data.txt"},
        "workflow_type": "CWL",
        "workflow_type_version": "v1.2",
        "workflow_engine": "cwltool",
        "workflow_url": "https://example.com/wf.cwl",
        "tags": {"env": "test"}
    })
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let boundary = "----sapporo-test-boundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"username\"\r\n\r\n{username}\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"password\"\r\n\r\n{password}\r\n\
         --{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/token")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["access_token"].as_str().unwrap().to_string()
}

// === service info & misc ===

#[tokio::test]
async fn test_service_info_carries_state_counts() {
    let svc = service().await;
    let (status, body) = send(&svc.app, get("/service-info", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "sapporo-service");
    assert_eq!(body["system_state_counts"]["COMPLETE"], 0);
    assert!(body["workflow_engine_versions"].get("cwltool").is_some());
}

#[tokio::test]
async fn test_executable_workflows_endpoint() {
    let svc = service_with(
        AuthConfig::disabled(),
        r#"{"workflows": ["https://ex/wf.cwl"]}"#,
    )
    .await;
    let (status, body) = send(&svc.app, get("/executable-workflows", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflows"][0], "https://ex/wf.cwl");
}

#[tokio::test]
async fn test_tasks_endpoints_are_unsupported() {
    let svc = service().await;
    let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    let run_id = created["run_id"].as_str().unwrap();

    let (status, body) = send(&svc.app, get(&format!("/runs/{run_id}/tasks"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["msg"].as_str().unwrap().contains("unsupported"));
    assert_eq!(body["status_code"], 400);

    let (status, _) = send(&svc.app, get(&format!("/runs/{run_id}/tasks/t1"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_error_body_shape_on_unknown_route() {
    let svc = service().await;
    let (status, body) = send(&svc.app, get("/no-such-route", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["msg"].is_string());
    assert_eq!(body["status_code"], 404);
}

// === run submission & retrieval ===

#[tokio::test]
async fn test_post_run_round_trips_request() {
    let svc = service().await;
    let (status, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    assert_eq!(status, StatusCode::OK, "{created}");
    let run_id = created["run_id"].as_str().unwrap();

    let (status, log) = send(&svc.app, get(&format!("/runs/{run_id}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let request = &log["request"];
    assert_eq!(request["workflow_type"], "CWL");
    assert_eq!(request["workflow_type_version"], "v1.2");
    assert_eq!(request["workflow_engine"], "cwltool");
    assert_eq!(request["workflow_url"], "https://example.com/wf.cwl");
    assert_eq!(request["workflow_params"], json!({"input": "data.txt"}));
    assert_eq!(request["tags"]["env"], "test");
}

#[tokio::test]
async fn test_post_run_multipart_with_attachment() {
    let svc = service().await;
    let boundary = "----sapporo-mp";
    let mut body = String::new();
    for (name, value) in [
        ("workflow_type", "CWL"),
        ("workflow_type_version", "v1.2"),
        ("workflow_engine", "cwltool"),
        ("workflow_url", "wf.cwl"),
        ("workflow_params", r#"{"input": "in.txt"}"#),
        ("tags", r#"{"env": "mp"}"#),
    ] {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"workflow_attachment\"; \
         filename=\"wf.cwl\"\r\nContent-Type: application/octet-stream\r\n\r\ncwlVersion: v1.2\r\n\
         --{boundary}--\r\n"
    ));
    let request = Request::builder()
        .method("POST")
        .uri("/runs")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, created) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::OK, "{created}");
    let run_id = created["run_id"].as_str().unwrap();

    let staged = svc
        .store
        .run_dir(run_id)
        .join(RunDirEntry::ExeDir.rel_path())
        .join("wf.cwl");
    assert!(staged.exists());
    assert_eq!(
        std::fs::read_to_string(staged).unwrap(),
        "cwlVersion: v1.2"
    );
}

#[tokio::test]
async fn test_post_run_rejects_engine_type_mismatch() {
    let svc = service().await;
    let mut body = cwl_request();
    body["workflow_engine"] = json!("cromwell");
    let (status, response) = send(&svc.app, post_json("/runs", &body, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["status_code"], 400);
}

#[tokio::test]
async fn test_post_run_names_bad_type_version_field() {
    let svc = service().await;
    let mut body = cwl_request();
    body["workflow_type_version"] = json!("v99");
    let (status, response) = send(&svc.app, post_json("/runs", &body, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        response["msg"]
            .as_str()
            .unwrap()
            .contains("workflow_type_version")
    );
}

#[tokio::test]
async fn test_whitelist_enforcement() {
    let svc = service_with(
        AuthConfig::disabled(),
        r#"{"workflows": ["https://ex/wf.cwl"]}"#,
    )
    .await;

    let mut allowed = cwl_request();
    allowed["workflow_url"] = json!("https://ex/wf.cwl");
    let (status, _) = send(&svc.app, post_json("/runs", &allowed, None)).await;
    assert_eq!(status, StatusCode::OK);

    let mut denied = cwl_request();
    denied["workflow_url"] = json!("https://ex/other.cwl");
    let (status, body) = send(&svc.app, post_json("/runs", &denied, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["msg"], "workflow_url not in executable workflows");
    assert_eq!(body["status_code"], 400);
}

#[tokio::test]
async fn test_run_status_is_live_from_disk() {
    let svc = service().await;
    let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();

    let (status, body) = send(&svc.app, get(&format!("/runs/{run_id}/status"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "QUEUED");

    // Mutate disk directly: the endpoint must see it without any snapshot
    svc.store
        .write_entry(&run_id, RunDirEntry::StateFile, "RUNNING")
        .await
        .unwrap();
    let (_, body) = send(&svc.app, get(&format!("/runs/{run_id}/status"), None)).await;
    assert_eq!(body["state"], "RUNNING");
}

// === listing ===

#[tokio::test]
async fn test_list_runs_ordering_and_total() {
    let svc = service().await;
    let mut run_ids = Vec::new();
    for i in 1..=3 {
        let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
        let run_id = created["run_id"].as_str().unwrap().to_string();
        svc.store
            .write_entry(
                &run_id,
                RunDirEntry::StartTime,
                &format!("2024-01-0{i}T00:00:00Z"),
            )
            .await
            .unwrap();
        run_ids.push(run_id);
    }
    svc.indexer.pass().await.unwrap();

    let (status, body) = send(&svc.app, get("/runs?sort_order=asc", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_runs"], 3);
    let listed: Vec<&str> = body["runs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["run_id"].as_str().unwrap())
        .collect();
    assert_eq!(listed, run_ids.iter().map(String::as_str).collect::<Vec<_>>());

    let (_, desc) = send(&svc.app, get("/runs?sort_order=desc", None)).await;
    let first = desc["runs"][0]["run_id"].as_str().unwrap();
    assert_eq!(first, run_ids[2]);
}

#[tokio::test]
async fn test_list_runs_tag_filter() {
    let svc = service().await;
    let mut prod = cwl_request();
    prod["tags"] = json!({"env": "prod"});
    let (_, created) = send(&svc.app, post_json("/runs", &prod, None)).await;
    let prod_id = created["run_id"].as_str().unwrap().to_string();

    let mut test_run = cwl_request();
    test_run["tags"] = json!({"env": "test"});
    send(&svc.app, post_json("/runs", &test_run, None)).await;

    svc.indexer.pass().await.unwrap();

    let (status, body) = send(&svc.app, get("/runs?tags=env:prod", None)).await;
    assert_eq!(status, StatusCode::OK);
    let runs = body["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["run_id"], prod_id.as_str());
}

#[tokio::test]
async fn test_list_runs_pagination() {
    let svc = service().await;
    for i in 1..=5 {
        let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
        let run_id = created["run_id"].as_str().unwrap().to_string();
        svc.store
            .write_entry(
                &run_id,
                RunDirEntry::StartTime,
                &format!("2024-01-0{i}T00:00:00Z"),
            )
            .await
            .unwrap();
    }
    svc.indexer.pass().await.unwrap();

    let (_, page1) = send(&svc.app, get("/runs?page_size=2", None)).await;
    assert_eq!(page1["runs"].as_array().unwrap().len(), 2);
    assert_eq!(page1["total_runs"], 5);
    let token = page1["next_page_token"].as_str().unwrap();

    let (_, page2) = send(
        &svc.app,
        get(&format!("/runs?page_size=2&page_token={token}"), None),
    )
    .await;
    assert_eq!(page2["runs"].as_array().unwrap().len(), 2);
    // No overlap between pages
    let ids1: Vec<&str> = page1["runs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["run_id"].as_str().unwrap())
        .collect();
    let ids2: Vec<&str> = page2["runs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["run_id"].as_str().unwrap())
        .collect();
    assert!(ids1.iter().all(|id| !ids2.contains(id)));
}

#[tokio::test]
async fn test_list_runs_latest_bypasses_snapshot() {
    let svc = service().await;
    let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();
    // Let the supervisor reap the stub dispatcher before snapshotting
    tokio::time::sleep(Duration::from_millis(300)).await;
    svc.indexer.pass().await.unwrap();

    // Disk moves on, the snapshot does not
    svc.store
        .write_entry(&run_id, RunDirEntry::StateFile, "RUNNING")
        .await
        .unwrap();

    let (_, stale) = send(&svc.app, get("/runs", None)).await;
    assert_eq!(stale["runs"][0]["state"], "QUEUED");

    let (_, live) = send(&svc.app, get("/runs?latest=true", None)).await;
    assert_eq!(live["runs"][0]["state"], "RUNNING");
}

// === cancellation & deletion ===

#[tokio::test]
async fn test_cancel_then_delete_round_trip() {
    let svc = service().await;
    let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &svc.app,
        post_json(&format!("/runs/{run_id}/cancel"), &json!({}), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // Dispatcher is a stub; finalize the cancellation by hand
    svc.store
        .write_entry(&run_id, RunDirEntry::StateFile, "CANCELED")
        .await
        .unwrap();

    // Cancel on a terminal run stays a 200 no-op
    let (status, _) = send(
        &svc.app,
        post_json(&format!("/runs/{run_id}/cancel"), &json!({}), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/runs/{run_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::OK);

    // Auth disabled: a deleted run reads as 404
    let (status, _) = send(&svc.app, get(&format!("/runs/{run_id}"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bulk_delete_requires_run_ids() {
    let svc = service().await;
    let request = Request::builder()
        .method("DELETE")
        .uri("/runs")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["msg"].as_str().unwrap().contains("run_ids"));

    let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    let run_id = created["run_id"].as_str().unwrap();
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/runs?run_ids={run_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run_ids"][0], run_id);
}

// === outputs ===

#[tokio::test]
async fn test_outputs_listing_and_file_fetch() {
    let svc = service().await;
    let (_, created) = send(&svc.app, post_json("/runs", &cwl_request(), None)).await;
    let run_id = created["run_id"].as_str().unwrap().to_string();

    let outputs_dir = svc
        .store
        .run_dir(&run_id)
        .join(RunDirEntry::OutputsDir.rel_path());
    std::fs::create_dir_all(outputs_dir.join("sub")).unwrap();
    std::fs::write(outputs_dir.join("sub/result.txt"), "payload").unwrap();

    let (status, body) = send(&svc.app, get(&format!("/runs/{run_id}/outputs"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outputs"][0]["file_name"], "sub/result.txt");

    let (status, body) = send(
        &svc.app,
        get(&format!("/runs/{run_id}/outputs/sub/result.txt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("payload".to_string()));

    // Traversal is refused
    let (status, _) = send(
        &svc.app,
        get(&format!("/runs/{run_id}/outputs/..%2Fstate.txt"), None),
    )
    .await;
    assert_ne!(status, StatusCode::OK);

    // Missing ro-crate reads as 404
    let (status, _) = send(&svc.app, get(&format!("/runs/{run_id}/ro-crate"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// === auth ===

#[tokio::test]
async fn test_token_and_me_flow() {
    let svc = service_with(local_auth(&[("alice", "s3cret")]), r#"{"workflows": []}"#).await;
    let token = login(&svc.app, "alice", "s3cret").await;

    let (status, body) = send(&svc.app, get("/me", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");

    let (status, _) = send(&svc.app, get("/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&svc.app, get("/me", Some("bogus.token.here"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ownership_isolation() {
    let svc = service_with(
        local_auth(&[("u1", "pass1"), ("u2", "pass2")]),
        r#"{"workflows": []}"#,
    )
    .await;
    let token1 = login(&svc.app, "u1", "pass1").await;
    let token2 = login(&svc.app, "u2", "pass2").await;

    let (status, created) = send(&svc.app, post_json("/runs", &cwl_request(), Some(&token1))).await;
    assert_eq!(status, StatusCode::OK, "{created}");
    let run_id = created["run_id"].as_str().unwrap().to_string();

    // Owner reads fine
    let (status, _) = send(&svc.app, get(&format!("/runs/{run_id}"), Some(&token1))).await;
    assert_eq!(status, StatusCode::OK);

    // Another user gets the literal forbidden body
    let (status, body) = send(&svc.app, get(&format!("/runs/{run_id}"), Some(&token2))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["msg"], "forbidden");
    assert_eq!(body["status_code"], 403);

    // A nonexistent run looks identical to a foreign one
    let (status, body) = send(
        &svc.app,
        get("/runs/00000000-0000-0000-0000-000000000000", Some(&token2)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["msg"], "forbidden");

    // Anonymous requests are rejected outright
    let (status, _) = send(&svc.app, get(&format!("/runs/{run_id}"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_runs_is_scoped_per_user() {
    let svc = service_with(
        local_auth(&[("u1", "pass1"), ("u2", "pass2")]),
        r#"{"workflows": []}"#,
    )
    .await;
    let token1 = login(&svc.app, "u1", "pass1").await;
    let token2 = login(&svc.app, "u2", "pass2").await;

    send(&svc.app, post_json("/runs", &cwl_request(), Some(&token1))).await;
    svc.indexer.pass().await.unwrap();

    let (_, mine) = send(&svc.app, get("/runs", Some(&token1))).await;
    assert_eq!(mine["total_runs"], 1);

    let (_, theirs) = send(&svc.app, get("/runs", Some(&token2))).await;
    assert_eq!(theirs["total_runs"], 0);
}
