// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router assembly and shared application state.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::config::AppConfig;
use crate::db::Index;
use crate::error::Result;
use crate::handlers;
use crate::run_store::RunStore;
use crate::schemas::{ExecutableWorkflows, ServiceInfo};
use crate::service_info::ServiceInfoSource;

/// Shared state behind every handler.
pub struct AppStateInner {
    pub config: AppConfig,
    pub store: RunStore,
    pub index: Arc<Index>,
    pub auth: Authenticator,
    /// service-info template; `system_state_counts` is filled per request.
    pub service_info: ServiceInfo,
    pub executable_workflows: ExecutableWorkflows,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppState {
    pub async fn new(config: AppConfig, index: Arc<Index>) -> Result<Self> {
        let source = ServiceInfoSource::new(&config.service_info, &config.executable_workflows);
        let service_info = source.load_service_info()?;
        let executable_workflows = source.load_executable_workflows()?;
        let auth = Authenticator::new(config.auth.clone())?;
        let store = RunStore::new(&config.run_dir);
        Ok(Self(Arc::new(AppStateInner {
            config,
            store,
            index,
            auth,
            service_info,
            executable_workflows,
            run_locks: Mutex::new(HashMap::new()),
        })))
    }

    /// Advisory per-run mutex serializing state writes from HTTP handlers.
    pub fn run_lock(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().expect("run lock map poisoned");
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Build the full application router, mounted under the configured prefix.
pub fn router(state: AppState) -> Router {
    let cors = if state.config.allow_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origin = state
            .config
            .allow_origin
            .parse::<HeaderValue>()
            .unwrap_or_else(|_| HeaderValue::from_static("*"));
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let api = Router::new()
        .route("/service-info", get(handlers::get_service_info))
        .route(
            "/runs",
            get(handlers::list_runs)
                .post(handlers::post_run)
                .delete(handlers::delete_runs),
        )
        .route(
            "/runs/{run_id}",
            get(handlers::get_run_log).delete(handlers::delete_run),
        )
        .route("/runs/{run_id}/status", get(handlers::get_run_status))
        .route("/runs/{run_id}/cancel", post(handlers::cancel_run))
        .route("/runs/{run_id}/outputs", get(handlers::get_outputs))
        .route(
            "/runs/{run_id}/outputs/{*path}",
            get(handlers::get_output_file),
        )
        .route("/runs/{run_id}/data/{*path}", get(handlers::get_data_file))
        .route("/runs/{run_id}/ro-crate", get(handlers::get_ro_crate))
        .route("/runs/{run_id}/tasks", get(handlers::list_tasks))
        .route("/runs/{run_id}/tasks/{task_id}", get(handlers::get_task))
        .route(
            "/executable-workflows",
            get(handlers::get_executable_workflows),
        )
        .route("/token", post(handlers::post_token))
        .route("/me", get(handlers::get_me))
        .route("/healthcheck", get(handlers::healthcheck))
        .fallback(handlers::not_found)
        .with_state(state.clone());

    let app = if state.config.url_prefix.is_empty() {
        api
    } else {
        Router::new()
            .nest(&state.config.url_prefix, api)
            .fallback(handlers::not_found)
    };

    app.layer(TraceLayer::new_for_http()).layer(cors)
}
