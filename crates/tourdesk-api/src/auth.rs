use std::hash::{Hash, Hasher};
use std::time::Duration;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tourdesk_core::lock::Role;

use crate::config::AppConfig;
use crate::error::AppError;

/// Who is calling a protected route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// The scheduler, authenticated by the shared cron secret
    Cron,
    /// A back-office user with a signed session token
    Session { user_id: String, role: Role },
}

impl Caller {
    pub const fn is_admin(&self) -> bool {
        matches!(self, Self::Session { role: Role::Admin, .. })
    }

    /// Label for logs; never includes the user id
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Session { .. } => "session",
        }
    }

    /// Stable hash of the session user for log correlation
    pub fn fingerprint(&self) -> Option<u64> {
        match self {
            Self::Cron => None,
            Self::Session { user_id, .. } => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                user_id.hash(&mut hasher);
                Some(hasher.finish())
            }
        }
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("Administrator role required"))
        }
    }

    pub fn require_admin_or_cron(&self) -> Result<(), AppError> {
        if matches!(self, Self::Cron) || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("Administrator role or cron secret required"))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    pub iat: Option<i64>,
}

/// Resolves bearer tokens into callers
#[derive(Clone)]
pub struct Authenticator {
    cron_secret: String,
    session_key: DecodingKey,
    clock_skew: Duration,
}

impl Authenticator {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cron_secret: config.cron_secret.clone(),
            session_key: DecodingKey::from_secret(config.session_secret.as_bytes()),
            clock_skew: config.auth_clock_skew,
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, AppError> {
        let token = extract_bearer_token(headers)?;
        if secrets_match(token, &self.cron_secret) {
            return Ok(Caller::Cron);
        }
        self.verify_session(token)
    }

    fn verify_session(&self, token: &str) -> Result<Caller, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);

        let decoded = decode::<SessionClaims>(token, &self.session_key, &validation)
            .map_err(|error| {
                AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
            })?;
        let claims = decoded.claims;

        if claims.sub.trim().is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        validate_issued_at(&claims, self.clock_skew)?;
        let role = claims
            .role
            .parse::<Role>()
            .map_err(|_| AppError::unauthorized("Token role is not recognised"))?;

        Ok(Caller::Session {
            user_id: claims.sub,
            role,
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn validate_issued_at(claims: &SessionClaims, clock_skew: Duration) -> Result<(), AppError> {
    let now = chrono::Utc::now().timestamp();
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(0);

    if let Some(iat) = claims.iat {
        if iat > now.saturating_add(skew) {
            return Err(AppError::unauthorized("Token `iat` is in the future"));
        }
    }
    Ok(())
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}
