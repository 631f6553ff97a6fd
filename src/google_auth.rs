//! Google OAuth access tokens for the Gmail, Sheets and Drive APIs.
//!
//! The consent flow happens elsewhere; this module only trades a stored refresh
//! token for short-lived access tokens and caches them.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct GoogleTokenSource {
    credentials: GoogleCredentials,
    http_client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl GoogleTokenSource {
    pub fn new(credentials: GoogleCredentials, http_client: reqwest::Client) -> Self {
        Self {
            credentials,
            http_client,
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, refreshed when within a minute of expiry.
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && !needs_refresh(token.expires_at, Utc::now())
        {
            return Ok(token.access_token.clone());
        }

        let token = self.refresh().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn refresh(&self) -> Result<CachedToken> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .http_client
            .post(TOKEN_ENDPOINT)
            .form(&params)
            .send()
            .await
            .context("Failed to reach Google token endpoint")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read token response")?;
        if !status.is_success() {
            bail!("Google token refresh failed: {}", describe_token_error(&body));
        }

        let token: TokenResponse =
            serde_json::from_str(&body).context("Invalid token response from Google")?;
        debug!(expires_in = token.expires_in, "Refreshed Google access token");

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}

fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - now <= Duration::seconds(REFRESH_MARGIN_SECS)
}

/// Turn Google's `{"error": ..., "error_description": ...}` into a readable message.
fn describe_token_error(body: &str) -> String {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            "refresh token expired or revoked (invalid_grant); log in again".to_string()
        }
        Ok(err) if err.error_description.is_empty() => err.error,
        Ok(err) => format!("{} ({})", err.error_description, err.error),
        Err(_) => body.to_string(),
    }
}
