//! Google Sheets v4 client authenticated as a service account

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{RowUpdate, SheetsApi, SheetsError};
use crate::config::SheetsConfig;
use crate::util::{compact_text, sanitize};

const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_TTL_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

fn updated_row_regex() -> Option<&'static Regex> {
    static UPDATED_ROW: OnceLock<Option<Regex>> = OnceLock::new();
    UPDATED_ROW
        .get_or_init(|| Regex::new(r"![A-Z]+(\d+)").ok())
        .as_ref()
}

/// Accept a PEM key with real newlines or with literal `\n` escapes
/// (as stored in most environment variable managers).
pub fn normalize_private_key(raw: &str) -> String {
    raw.trim()
        .trim_matches('"')
        .replace("\\r\\n", "\n")
        .replace("\\n", "\n")
}

/// Row index from an append response's `updatedRange` (`'Tab'!A15:P15` -> 15)
pub fn parse_row_index(updated_range: &str) -> Option<i64> {
    updated_row_regex()?
        .captures(updated_range)
        .and_then(|captures| captures.get(1))
        .and_then(|row| row.as_str().parse().ok())
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AppendResponse {
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: Option<String>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// HTTPS client for `values:batchUpdate` and `values:append`
#[derive(Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    config: Arc<SheetsConfig>,
    key: Arc<EncodingKey>,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl GoogleSheetsClient {
    pub fn new(config: SheetsConfig) -> Result<Self, SheetsError> {
        let pem = normalize_private_key(&config.private_key);
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|error| SheetsError::Credentials(sanitize(&error)))?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|error| SheetsError::Transport(sanitize(&error)))?;

        Ok(Self {
            http,
            config: Arc::new(config),
            key: Arc::new(key),
            token: Arc::new(Mutex::new(None)),
        })
    }

    fn signed_assertion(&self) -> Result<String, SheetsError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.config.service_account_email,
            scope: SPREADSHEETS_SCOPE,
            aud: &self.config.token_uri,
            iat,
            exp: iat + ASSERTION_TTL_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|error| SheetsError::Credentials(sanitize(&error)))
    }

    /// Cached OAuth access token, refreshed shortly before it expires
    async fn access_token(&self) -> Result<String, SheetsError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let assertion = self.signed_assertion()?;
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|error| SheetsError::Transport(sanitize(&error)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SheetsError::Auth(format!(
                "token exchange failed with HTTP {status}: {}",
                compact_text(&body)
            )));
        }

        let payload = response
            .json::<TokenResponse>()
            .await
            .map_err(|error| SheetsError::InvalidResponse(sanitize(&error)))?;
        let lifetime = Duration::from_secs(payload.expires_in.unwrap_or(3600));

        tracing::debug!(
            expires_in_secs = lifetime.as_secs(),
            "Obtained Sheets access token"
        );
        *guard = Some(CachedToken {
            value: payload.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(payload.access_token)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<reqwest::Response, SheetsError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| SheetsError::Transport(sanitize(&error)))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        if status == 401 {
            // Force a fresh token on the next call
            self.token.lock().await.take();
        }
        let body = response.text().await.unwrap_or_default();
        Err(SheetsError::from_response(status, &body))
    }
}

#[async_trait]
impl SheetsApi for GoogleSheetsClient {
    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        rows: &[RowUpdate],
    ) -> Result<(), SheetsError> {
        let url = format!(
            "{}/spreadsheets/{}/values:batchUpdate",
            self.config.api_base_url,
            urlencoding::encode(spreadsheet_id)
        );
        let data: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "range": row.range,
                    "majorDimension": "ROWS",
                    "values": [row.values],
                })
            })
            .collect();
        let body = json!({
            "valueInputOption": "USER_ENTERED",
            "data": data,
        });

        self.post_json(&url, &body).await?;
        Ok(())
    }

    async fn append(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: &[Value],
    ) -> Result<i64, SheetsError> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}:append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
            self.config.api_base_url,
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode(range)
        );
        let body = json!({
            "majorDimension": "ROWS",
            "values": [values],
        });

        let response = self.post_json(&url, &body).await?;
        // The row exists from here on
        let payload = response
            .json::<AppendResponse>()
            .await
            .map_err(|error| SheetsError::UnconfirmedAppend(sanitize(&error)))?;
        appended_row(payload)
    }
}

fn appended_row(payload: AppendResponse) -> Result<i64, SheetsError> {
    let updated_range = payload
        .updates
        .and_then(|updates| updates.updated_range)
        .ok_or_else(|| {
            SheetsError::UnconfirmedAppend("append response has no updatedRange".to_string())
        })?;
    parse_row_index(&updated_range).ok_or_else(|| {
        SheetsError::UnconfirmedAppend(format!("unparseable updatedRange `{updated_range}`"))
    })
}
