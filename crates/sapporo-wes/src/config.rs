// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service configuration.
//!
//! Every CLI flag maps to a `SAPPORO_`-prefixed environment variable with
//! priority CLI > env > built-in default. Auth settings live in a separate
//! JSON file (`--auth-config`) so credentials stay out of the process
//! arguments.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Secret shipped in the example auth config. Startup refuses to run with it
/// outside debug mode.
pub const BUNDLED_DEFAULT_SECRET: &str = "sapporo-wes-default-secret-key-change-me";

/// Minimum Shannon entropy (bits per character) accepted for the local-mode
/// signing secret in non-debug builds.
const MIN_SECRET_ENTROPY: f64 = 3.0;

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sapporo-wes",
    about = "GA4GH Workflow Execution Service frontend that manages workflow runs on the local filesystem",
    version
)]
pub struct Args {
    /// Host address to bind.
    #[arg(long, env = "SAPPORO_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind.
    #[arg(long, short = 'p', env = "SAPPORO_PORT", default_value_t = 1122)]
    pub port: u16,

    /// Enable debug mode (relaxed auth constraints, verbose errors).
    #[arg(long, env = "SAPPORO_DEBUG")]
    pub debug: bool,

    /// Base directory holding all run directories and the index database.
    #[arg(long, short = 'r', env = "SAPPORO_RUN_DIR", default_value = "./runs")]
    pub run_dir: PathBuf,

    /// Path to service-info.json.
    #[arg(long, env = "SAPPORO_SERVICE_INFO", default_value = "./service-info.json")]
    pub service_info: PathBuf,

    /// Path to executable-workflows.json (the workflow_url whitelist).
    #[arg(
        long,
        env = "SAPPORO_EXECUTABLE_WORKFLOWS",
        default_value = "./executable-workflows.json"
    )]
    pub executable_workflows: PathBuf,

    /// Path to the dispatcher script forked for each run.
    #[arg(long, env = "SAPPORO_RUN_SH", default_value = "./run.sh")]
    pub run_sh: PathBuf,

    /// Path to auth-config.json. When omitted, authentication is disabled.
    #[arg(long, env = "SAPPORO_AUTH_CONFIG")]
    pub auth_config: Option<PathBuf>,

    /// URL prefix all endpoints are mounted under (e.g. `/wes`).
    #[arg(long, env = "SAPPORO_URL_PREFIX", default_value = "")]
    pub url_prefix: String,

    /// External base URL advertised in generated file_urls. Defaults to
    /// `http://{host}:{port}{url_prefix}`.
    #[arg(long, env = "SAPPORO_BASE_URL")]
    pub base_url: Option<String>,

    /// Access-Control-Allow-Origin header value.
    #[arg(long, env = "SAPPORO_ALLOW_ORIGIN", default_value = "*")]
    pub allow_origin: String,

    /// Remove run directories whose start_time is older than this many days.
    #[arg(long, env = "SAPPORO_RUN_REMOVE_OLDER_THAN_DAYS", value_parser = clap::value_parser!(u32).range(1..))]
    pub run_remove_older_than_days: Option<u32>,

    /// Minutes between index snapshot rebuilds.
    #[arg(long, env = "SAPPORO_SNAPSHOT_INTERVAL", default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    pub snapshot_interval: u32,
}

/// Resolved service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub addr: SocketAddr,
    pub debug: bool,
    pub run_dir: PathBuf,
    pub service_info: PathBuf,
    pub executable_workflows: PathBuf,
    pub run_sh: PathBuf,
    pub url_prefix: String,
    pub base_url: String,
    pub allow_origin: String,
    pub run_remove_older_than_days: Option<u32>,
    pub snapshot_interval_mins: u32,
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Resolve CLI arguments into a validated configuration.
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        let run_dir = absolutize(&args.run_dir);
        let service_info = absolutize(&args.service_info);
        let executable_workflows = absolutize(&args.executable_workflows);
        let run_sh = absolutize(&args.run_sh);

        for (label, path) in [
            ("service-info", &service_info),
            ("run-sh", &run_sh),
        ] {
            if !path.exists() {
                return Err(ConfigError::MissingFile {
                    label,
                    path: path.clone(),
                });
            }
        }

        let auth = match &args.auth_config {
            Some(path) => {
                let path = absolutize(path);
                let content = std::fs::read_to_string(&path).map_err(|_| {
                    ConfigError::MissingFile {
                        label: "auth-config",
                        path: path.clone(),
                    }
                })?;
                let auth: AuthConfig =
                    serde_json::from_str(&content).map_err(ConfigError::InvalidAuthConfig)?;
                auth.validate(args.debug)?;
                auth
            }
            None => AuthConfig::disabled(),
        };

        let url_prefix = normalize_prefix(&args.url_prefix);
        let base_url = args.base_url.clone().unwrap_or_else(|| {
            format!("http://{}:{}{}", args.host, args.port, url_prefix)
        });
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            addr: SocketAddr::new(args.host, args.port),
            debug: args.debug,
            run_dir,
            service_info,
            executable_workflows,
            run_sh,
            url_prefix,
            base_url,
            allow_origin: args.allow_origin,
            run_remove_older_than_days: args.run_remove_older_than_days,
            snapshot_interval_mins: args.snapshot_interval,
            auth,
        })
    }

    /// Snapshot of the configuration captured into each run directory as
    /// `sapporo_config.json`, so the dispatcher and post-run helpers can work
    /// without access to the service process.
    pub fn capture(&self) -> serde_json::Value {
        serde_json::json!({
            "sapporo_version": env!("CARGO_PKG_VERSION"),
            "run_dir": self.run_dir,
            "run_sh": self.run_sh,
            "url_prefix": self.url_prefix,
            "base_url": self.base_url,
            "auth_enabled": self.auth.auth_enabled,
        })
    }
}

/// Leading slash, no trailing slash, empty for root.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Identity-provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdpProvider {
    /// Local user list + HS256 tokens issued by this service.
    Sapporo,
    /// Verification-only against an external OIDC provider.
    External,
}

/// A local user entry. Passwords are stored as Argon2id PHC strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub username: String,
    pub password_hash: String,
}

/// Settings for local (sapporo) mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SapporoAuthConfig {
    pub secret_key: String,
    /// Token lifetime in hours. `null` means non-expiring, which is only
    /// honored in debug mode.
    pub expires_delta_hours: Option<u64>,
    #[serde(default)]
    pub users: Vec<AuthUser>,
}

/// Settings for external (OIDC) mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAuthConfig {
    pub idp_url: String,
    pub jwt_audience: String,
    #[serde(default = "default_client_mode")]
    pub client_mode: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_client_mode() -> String {
    "public".to_string()
}

/// Top-level auth configuration, loaded from `--auth-config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_enabled: bool,
    #[serde(default = "default_idp_provider")]
    pub idp_provider: IdpProvider,
    #[serde(default)]
    pub sapporo_auth_config: Option<SapporoAuthConfig>,
    #[serde(default)]
    pub external_config: Option<ExternalAuthConfig>,
}

fn default_idp_provider() -> IdpProvider {
    IdpProvider::Sapporo
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self {
            auth_enabled: false,
            idp_provider: IdpProvider::Sapporo,
            sapporo_auth_config: None,
            external_config: None,
        }
    }

    /// Startup validation. Weak signing secrets and plaintext IdP transport
    /// are fatal outside debug mode.
    pub fn validate(&self, debug: bool) -> Result<(), ConfigError> {
        if !self.auth_enabled {
            return Ok(());
        }
        match self.idp_provider {
            IdpProvider::Sapporo => {
                let local = self
                    .sapporo_auth_config
                    .as_ref()
                    .ok_or(ConfigError::MissingSection("sapporo_auth_config"))?;
                if !debug {
                    if local.secret_key.len() < 32 {
                        return Err(ConfigError::WeakSecret("secret_key is shorter than 32 bytes"));
                    }
                    if local.secret_key == BUNDLED_DEFAULT_SECRET {
                        return Err(ConfigError::WeakSecret(
                            "secret_key matches the bundled default",
                        ));
                    }
                    if shannon_entropy(&local.secret_key) < MIN_SECRET_ENTROPY {
                        return Err(ConfigError::WeakSecret("secret_key has low entropy"));
                    }
                    if local.expires_delta_hours.is_none() {
                        return Err(ConfigError::WeakSecret(
                            "non-expiring tokens are only allowed in debug mode",
                        ));
                    }
                }
            }
            IdpProvider::External => {
                let external = self
                    .external_config
                    .as_ref()
                    .ok_or(ConfigError::MissingSection("external_config"))?;
                let allow_insecure = std::env::var("SAPPORO_ALLOW_INSECURE_IDP")
                    .map(|v| v == "true")
                    .unwrap_or(false);
                if !external.idp_url.starts_with("https://") && !(debug && allow_insecure) {
                    return Err(ConfigError::InsecureIdp(external.idp_url.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0u32) += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&n| {
            let p = f64::from(n) / len;
            -p * p.log2()
        })
        .sum()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A file named on the command line does not exist.
    #[error("{label} file does not exist: {path}")]
    MissingFile {
        label: &'static str,
        path: PathBuf,
    },
    /// auth-config.json did not parse.
    #[error("invalid auth config: {0}")]
    InvalidAuthConfig(#[source] serde_json::Error),
    /// auth is enabled but the section for the selected provider is absent.
    #[error("auth config is missing the `{0}` section")]
    MissingSection(&'static str),
    /// The local signing secret failed the strength checks.
    #[error("refusing to start with a weak signing secret: {0}")]
    WeakSecret(&'static str),
    /// The external IdP URL is not HTTPS.
    #[error("idp_url must use https (got {0}); set SAPPORO_ALLOW_INSECURE_IDP=true in debug mode to override")]
    InsecureIdp(String),
}
