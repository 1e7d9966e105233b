// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local (sapporo) authentication: an operator-managed user list with
//! Argon2id password hashes and HS256 tokens issued by this service.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::SapporoAuthConfig;
use crate::error::{AppError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// Issues and verifies tokens for the local user list.
pub struct LocalAuthenticator {
    config: SapporoAuthConfig,
}

impl LocalAuthenticator {
    pub fn new(config: SapporoAuthConfig) -> Self {
        Self { config }
    }

    /// Verify a username/password pair and issue a compact JWT.
    pub fn login(&self, username: &str, password: &str) -> Result<String> {
        let invalid = || AppError::Unauthenticated("invalid username or password".into());
        let user = self
            .config
            .users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(invalid)?;

        let parsed = PasswordHash::new(&user.password_hash)
            .map_err(|e| AppError::Internal(format!("malformed password hash on record: {e}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| invalid())?;

        let iat = chrono::Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: username.to_string(),
            iat,
            exp: self
                .config
                .expires_delta_hours
                .map(|hours| iat + hours * 3600),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.secret_key.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
    }

    /// Verify a presented token and return the bound username.
    pub fn verify(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        if self.config.expires_delta_hours.is_none() {
            // Non-expiring debug tokens carry no exp claim
            validation.required_spec_claims.clear();
            validation.validate_exp = false;
        }
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.secret_key.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::Unauthenticated("the token has expired".into())
            }
            _ => AppError::Unauthenticated("invalid token".into()),
        })?;
        Ok(data.claims.sub)
    }
}
