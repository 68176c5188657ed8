use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::auth::refresh::RefreshClient;
use crate::error::ApiError;

/// Token values a downstream client picked up on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Milliseconds since epoch
    pub access_token_expires_at: i64,
}

/// Observer invoked synchronously when a client rotates its tokens.
/// Whatever it does, the session itself is never updated from here.
pub type TokenObserver = Arc<dyn Fn(&RotatedTokens) + Send + Sync>;

/// Downstream API client factory.
///
/// Stateless adapter: binds a caller's tokens to a provider-API client. It
/// never refreshes up front (the lifecycle controller already did) and never
/// writes back into the session.
pub struct ClientFactory {
    /// Shared HTTP client with connection pooling
    client: Client,

    refresher: Arc<RefreshClient>,
}

impl ClientFactory {
    pub fn new(
        refresher: Arc<RefreshClient>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, refresher })
    }

    /// Build a client scoped to a single caller
    pub fn build_client(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        observer: Option<TokenObserver>,
    ) -> AuthenticatedClient {
        AuthenticatedClient {
            http: self.client.clone(),
            refresher: self.refresher.clone(),
            tokens: RwLock::new(BoundTokens {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.filter(|t| !t.is_empty()).map(str::to_string),
            }),
            observer,
        }
    }
}

struct BoundTokens {
    access_token: String,
    refresh_token: Option<String>,
}

/// Provider-API client bound to one caller's tokens
pub struct AuthenticatedClient {
    http: Client,
    refresher: Arc<RefreshClient>,
    tokens: RwLock<BoundTokens>,
    observer: Option<TokenObserver>,
}

impl AuthenticatedClient {
    /// GET a JSON document from a provider API
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        self.send_json(Method::GET, url, None).await
    }

    /// Send a request with an optional JSON body and decode the JSON response.
    ///
    /// A 401 with a bound refresh token triggers one transparent rotation
    /// followed by a single replay; any other failure is returned as-is.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, ApiError> {
        let mut rotated = false;

        loop {
            let access_token = self.tokens.read().await.access_token.clone();

            let mut request = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&access_token);
            if let Some(body) = body {
                request = request.json(body);
            }

            tracing::debug!(method = %method, url = %url, "Sending downstream request");

            let response = request.send().await.map_err(|e| {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else {
                    "request_error"
                };
                tracing::warn!(error_kind = error_kind, error = %e, url = %url, "Downstream request error");
                ApiError::DownstreamApiError {
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    message: format!("Downstream request failed: {} (kind: {})", e, error_kind),
                }
            })?;

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !rotated && self.rotate().await {
                rotated = true;
                continue;
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                tracing::error!(
                    status = status.as_u16(),
                    url = %url,
                    response_body = %error_text,
                    "Downstream request failed with error response"
                );
                return Err(ApiError::DownstreamApiError {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            return response.json::<T>().await.map_err(|e| ApiError::DownstreamApiError {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message: format!("Malformed downstream response: {}", e),
            });
        }
    }

    /// Rotate the bound tokens through the refresh engine. Returns whether
    /// a replay is worthwhile.
    async fn rotate(&self) -> bool {
        let Some(refresh_token) = self.tokens.read().await.refresh_token.clone() else {
            return false;
        };

        let tokens = match self.refresher.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Downstream client could not rotate tokens: {}", e);
                return false;
            }
        };

        let rotated = RotatedTokens {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            access_token_expires_at: tokens.access_token_expires_at,
        };

        {
            let mut bound = self.tokens.write().await;
            bound.access_token = tokens.access_token;
            if let Some(new_refresh) = tokens.refresh_token {
                bound.refresh_token = Some(new_refresh);
            }
        }

        tracing::info!(
            has_refresh_token = rotated.refresh_token.is_some(),
            expires_at = rotated.access_token_expires_at,
            "New tokens received by downstream client (not persisted to session)"
        );

        if let Some(observer) = &self.observer {
            observer(&rotated);
        }

        true
    }

    /// Current access token held by this client
    pub async fn access_token(&self) -> String {
        self.tokens.read().await.access_token.clone()
    }
}
