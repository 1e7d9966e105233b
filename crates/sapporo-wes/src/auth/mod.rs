// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authentication and per-run authorization.
//!
//! Two mutually exclusive verification modes (local user list or external
//! OIDC provider) behind one [`Authenticator`]. Handlers call
//! [`Authenticator::authenticate`] to bind a username to the request, then
//! [`authorize_run_access`] before touching a run.

pub mod external;
pub mod local;

use axum::http::HeaderMap;

use crate::config::{AuthConfig, IdpProvider};
use crate::error::{AppError, Result};
use external::ExternalVerifier;
use local::LocalAuthenticator;

enum Mode {
    Disabled,
    Local(LocalAuthenticator),
    External(ExternalVerifier),
}

/// Request-level authentication for the configured mode.
pub struct Authenticator {
    mode: Mode,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Result<Self> {
        let mode = if !config.auth_enabled {
            Mode::Disabled
        } else {
            match config.idp_provider {
                IdpProvider::Sapporo => {
                    let local = config.sapporo_auth_config.ok_or_else(|| {
                        AppError::Internal("auth enabled without sapporo_auth_config".into())
                    })?;
                    Mode::Local(LocalAuthenticator::new(local))
                }
                IdpProvider::External => {
                    let external = config.external_config.ok_or_else(|| {
                        AppError::Internal("auth enabled without external_config".into())
                    })?;
                    Mode::External(ExternalVerifier::new(external)?)
                }
            }
        };
        Ok(Self { mode })
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.mode, Mode::Disabled)
    }

    /// Verify the request's bearer token. Returns `None` when auth is
    /// disabled, the verified username otherwise.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<String>> {
        match &self.mode {
            Mode::Disabled => Ok(None),
            Mode::Local(local) => {
                let token = bearer_token(headers)?;
                local.verify(token).map(Some)
            }
            Mode::External(external) => {
                let token = bearer_token(headers)?;
                external.verify(token).await.map(Some)
            }
        }
    }

    /// `POST /token` is only meaningful in local mode.
    pub fn login(&self, username: &str, password: &str) -> Result<String> {
        match &self.mode {
            Mode::Local(local) => local.login(username, password),
            Mode::Disabled => Err(AppError::InvalidRequest(
                "authentication is disabled on this service".into(),
            )),
            Mode::External(_) => Err(AppError::InvalidRequest(
                "tokens are issued by the external identity provider".into(),
            )),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthenticated("missing Authorization header".into()))?
        .to_str()
        .map_err(|_| AppError::Unauthenticated("malformed Authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthenticated("expected a Bearer token".into()))
}

/// Gate access to a run.
///
/// With auth enabled, a nonexistent run and an ownership mismatch both
/// produce the same 403, so protected endpoints cannot be used as an
/// existence oracle. 404 is reserved for auth-disabled deployments.
pub fn authorize_run_access(
    caller: Option<&str>,
    run_exists: bool,
    owner: Option<&str>,
) -> Result<()> {
    match caller {
        None => {
            if run_exists {
                Ok(())
            } else {
                Err(AppError::NotFound("run not found".into()))
            }
        }
        Some(caller) => {
            if run_exists && owner == Some(caller) {
                Ok(())
            } else {
                Err(AppError::Forbidden("forbidden".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_disabled_missing_run_is_404() {
        let err = authorize_run_access(None, false, None).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_auth_disabled_existing_run_allowed() {
        authorize_run_access(None, true, None).unwrap();
    }

    #[test]
    fn test_owner_allowed() {
        authorize_run_access(Some("alice"), true, Some("alice")).unwrap();
    }

    #[test]
    fn test_mismatch_and_missing_are_both_403() {
        let mismatch = authorize_run_access(Some("bob"), true, Some("alice")).unwrap_err();
        let missing = authorize_run_access(Some("bob"), false, None).unwrap_err();
        assert!(matches!(mismatch, AppError::Forbidden(_)));
        assert!(matches!(missing, AppError::Forbidden(_)));
        assert_eq!(mismatch.to_string(), missing.to_string());
    }

    #[test]
    fn test_unowned_run_denied_when_authenticated() {
        let err = authorize_run_access(Some("alice"), true, None).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def.ghi");
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwYXNz".parse().unwrap(),
        );
        assert!(bearer_token(&headers).is_err());
    }

    #[tokio::test]
    async fn test_disabled_authenticator_binds_no_user() {
        let auth = Authenticator::new(crate::config::AuthConfig::disabled()).unwrap();
        assert!(!auth.enabled());
        let user = auth.authenticate(&HeaderMap::new()).await.unwrap();
        assert!(user.is_none());
    }
}
