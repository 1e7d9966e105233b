// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External authentication: verification-only against an OIDC identity
//! provider.
//!
//! Discovery metadata is cached for an hour, the JWKS for five minutes. A
//! token whose `kid` is not in the cached set triggers exactly one eager
//! refetch before rejection, so key rotation is picked up without a
//! per-request round trip. Only the RS* family is accepted; HS* is refused
//! outright to rule out key-confusion with the local mode.

use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ExternalAuthConfig;
use crate::error::{AppError, Result};

const DISCOVERY_TTL: Duration = Duration::from_secs(3600);
const JWKS_TTL: Duration = Duration::from_secs(300);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

const ACCEPTED_ALGS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// The subset of the OIDC discovery document this service consumes.
#[derive(Debug, Clone, Deserialize)]
struct Discovery {
    issuer: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct IdClaims {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
}

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

#[derive(Default)]
struct Caches {
    discovery: Option<Cached<Discovery>>,
    jwks: Option<Cached<JwkSet>>,
}

/// Token verifier backed by an external IdP's JWKS.
pub struct ExternalVerifier {
    config: ExternalAuthConfig,
    http: reqwest::Client,
    caches: RwLock<Caches>,
}

impl ExternalVerifier {
    pub fn new(config: ExternalAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            caches: RwLock::new(Caches::default()),
        })
    }

    /// Verify a bearer token and return the bound username
    /// (`preferred_username` when present, `sub` otherwise).
    pub async fn verify(&self, token: &str) -> Result<String> {
        let header = decode_header(token)
            .map_err(|_| AppError::Unauthenticated("invalid token".into()))?;
        if !ACCEPTED_ALGS.contains(&header.alg) {
            return Err(AppError::Unauthenticated(format!(
                "token algorithm {:?} is not accepted; only RS256/RS384/RS512 are",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AppError::Unauthenticated("token is missing a `kid` header".into()))?;

        let discovery = self.discovery().await?;
        let jwk = self.key_for(&kid).await?;
        let decoding_key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| AppError::Unauthenticated(format!("unusable JWKS key: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.config.jwt_audience]);
        validation.set_issuer(&[&discovery.issuer]);
        let data = decode::<IdClaims>(token, &decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AppError::Unauthenticated("the token has expired".into())
                }
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    AppError::Unauthenticated("token audience mismatch".into())
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    AppError::Unauthenticated("token issuer mismatch".into())
                }
                _ => AppError::Unauthenticated("invalid token".into()),
            }
        })?;
        Ok(data
            .claims
            .preferred_username
            .unwrap_or(data.claims.sub))
    }

    async fn discovery(&self) -> Result<Discovery> {
        if let Some(cached) = &self.caches.read().await.discovery
            && cached.fetched_at.elapsed() < DISCOVERY_TTL
        {
            return Ok(cached.value.clone());
        }
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.config.idp_url.trim_end_matches('/')
        );
        let discovery: Discovery = self.fetch_json(&url).await?;
        self.caches.write().await.discovery = Some(Cached {
            value: discovery.clone(),
            fetched_at: Instant::now(),
        });
        Ok(discovery)
    }

    /// Find the key for `kid`, refreshing the JWKS once on a miss.
    async fn key_for(&self, kid: &str) -> Result<Jwk> {
        if let Some(cached) = &self.caches.read().await.jwks
            && cached.fetched_at.elapsed() < JWKS_TTL
            && let Some(jwk) = cached.value.find(kid)
        {
            return Ok(jwk.clone());
        }

        debug!(kid = %kid, "kid not in cached JWKS, refetching");
        let jwks = self.refresh_jwks().await?;
        jwks.find(kid).cloned().ok_or_else(|| {
            AppError::Unauthenticated(format!("token `kid` {kid} is not in the provider's JWKS"))
        })
    }

    async fn refresh_jwks(&self) -> Result<JwkSet> {
        let discovery = self.discovery().await?;
        let jwks: JwkSet = self.fetch_json(&discovery.jwks_uri).await?;
        self.caches.write().await.jwks = Some(Cached {
            value: jwks.clone(),
            fetched_at: Instant::now(),
        });
        Ok(jwks)
    }

    /// GET + JSON-decode with up to three retries on transient failure.
    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_error = String::new();
        for (attempt, backoff) in RETRY_BACKOFF.iter().enumerate() {
            match self.http.get(url).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => match response.json::<T>().await {
                        Ok(value) => return Ok(value),
                        Err(e) => last_error = format!("invalid response body: {e}"),
                    },
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            warn!(url = %url, attempt = attempt + 1, error = %last_error, "IdP fetch failed");
            tokio::time::sleep(*backoff).await;
        }
        Err(AppError::Upstream(format!(
            "failed to fetch {url} after {} attempts: {last_error}",
            RETRY_BACKOFF.len()
        )))
    }
}
