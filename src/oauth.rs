//! OAuth token exchange against the accounts service.
//!
//! The rest of the pipeline only sees [`TokenProvider`]; tests substitute a
//! stub so no network is involved in exercising the refresh protocol.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{header, Client};
use serde::Deserialize;
use std::time::Duration;

use crate::config::SpotifyConfig;

/// Successful token-refresh response.
///
/// The service may rotate the refresh token; when it does not, the caller
/// keeps using the old one.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds.
    pub expires_in: i64,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Exchange a refresh token for a fresh access token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// Token provider for the Spotify accounts service.
pub struct SpotifyOAuth {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl SpotifyOAuth {
    pub fn new(config: &SpotifyConfig) -> Self {
        Self {
            http: Client::new(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.client_id, self.client_secret);
        format!("Basic {}", general_purpose::STANDARD.encode(raw))
    }
}

#[async_trait]
impl TokenProvider for SpotifyOAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .header(header::AUTHORIZATION, self.basic_auth())
            .form(&params)
            .send()
            .await
            .context("Token refresh request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Failed to refresh token. Status: {} - {}",
                status,
                body
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token refresh response")?;
        Ok(token)
    }
}

/// Build an HTTP client bound to an access token.
///
/// Every request sent through it carries the bearer header; the optional
/// timeout bounds how long a hung request can hold the queue lane.
pub fn http_client(access_token: &str, timeout: Option<Duration>) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    let mut auth = header::HeaderValue::from_str(&format!("Bearer {access_token}"))
        .context("Access token is not a valid header value")?;
    auth.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, auth);

    let mut builder = Client::builder().default_headers(headers);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("Failed to build HTTP client")
}
