// Token refresh logic

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::types::{OAuthErrorBody, RefreshedTokens, TokenEndpointResponse, DEFAULT_TOKEN_LIFETIME_MS};
use crate::config::ProviderSettings;

/// Any reason a refresh exchange did not produce a new access token.
/// Never retried.
#[derive(Error, Debug)]
pub enum RefreshFailure {
    #[error("refresh token is empty")]
    MissingRefreshToken,

    #[error("refresh request timed out after {0:?}")]
    Timeout(Duration),

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("provider rejected refresh: {status} {error}")]
    Rejected {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("malformed refresh response: {0}")]
    Malformed(String),
}

/// Token Refresh Engine.
///
/// Exchanges a refresh token for a new access token at the provider's token
/// endpoint (`grant_type=refresh_token`). Holds only read-only provider
/// configuration; every call is independent.
pub struct RefreshClient {
    client: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    timeout: Duration,
}

impl RefreshClient {
    pub fn new(provider: &ProviderSettings, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token_url: provider.token_url.clone(),
            client_id: provider.client_id.clone(),
            client_secret: provider.client_secret.clone(),
            timeout,
        })
    }

    /// Exchange `refresh_token` for a new access token.
    ///
    /// `refresh_token` in the result is `Some` only when the provider rotated
    /// it; callers keep the previous one otherwise.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshFailure> {
        if refresh_token.is_empty() {
            return Err(RefreshFailure::MissingRefreshToken);
        }

        tracing::info!("Refreshing access token via {}", self.token_url);

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                "Refresh rejected by provider: status={}, body={}",
                status,
                error_text
            );

            let (error, description) = match serde_json::from_str::<OAuthErrorBody>(&error_text) {
                Ok(body) => (body.error, body.error_description),
                Err(_) => (error_text, None),
            };

            return Err(RefreshFailure::Rejected {
                status: status.as_u16(),
                error,
                description,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let data: TokenEndpointResponse = serde_json::from_str(&body)
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;

        if data.access_token.is_empty() {
            return Err(RefreshFailure::Malformed(
                "response does not contain access_token".to_string(),
            ));
        }

        let now_ms = Utc::now().timestamp_millis();
        let access_token_expires_at = data
            .expires_at_ms(now_ms)
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?
            .unwrap_or(now_ms + DEFAULT_TOKEN_LIFETIME_MS);

        tracing::info!(
            rotated = data.refresh_token.is_some(),
            "Access token refreshed, expires at {}",
            access_token_expires_at
        );

        Ok(RefreshedTokens {
            access_token: data.access_token,
            access_token_expires_at,
            refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        })
    }

    fn transport_failure(&self, err: reqwest::Error) -> RefreshFailure {
        if err.is_timeout() {
            RefreshFailure::Timeout(self.timeout)
        } else {
            RefreshFailure::Network(err.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockito::Matcher;
    use std::io::Write;

    pub(crate) fn provider_for(server_url: &str) -> ProviderSettings {
        ProviderSettings {
            client_id: "test-client-id".to_string(),
            client_secret: "test-client-secret".to_string(),
            auth_url: Url::parse(&format!("{}/authorize", server_url)).unwrap(),
            token_url: Url::parse(&format!("{}/token", server_url)).unwrap(),
            userinfo_url: Url::parse(&format!("{}/userinfo", server_url)).unwrap(),
            redirect_uri: Url::parse("http://localhost:3000/auth/callback").unwrap(),
            scopes: vec!["openid".to_string()],
        }
    }

    fn engine(server: &mockito::Server) -> RefreshClient {
        RefreshClient::new(&provider_for(&server.url()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_success_without_rotation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "R1".into()),
                Matcher::UrlEncoded("client_id".into(), "test-client-id".into()),
                Matcher::UrlEncoded("client_secret".into(), "test-client-secret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"A2","expires_in":3600,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let before = Utc::now().timestamp_millis();
        let tokens = engine(&server).refresh("R1").await.unwrap();
        let after = Utc::now().timestamp_millis();

        assert_eq!(tokens.access_token, "A2");
        assert_eq!(tokens.refresh_token, None);
        assert!(tokens.access_token_expires_at >= before + 3_600_000);
        assert!(tokens.access_token_expires_at <= after + 3_600_000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_success_with_rotation() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A2","refresh_token":"R2","expires_at":1900000000}"#)
            .create_async()
            .await;

        let tokens = engine(&server).refresh("R1").await.unwrap();
        assert_eq!(tokens.refresh_token.as_deref(), Some("R2"));
        assert_eq!(tokens.access_token_expires_at, 1_900_000_000_000);
    }

    #[tokio::test]
    async fn test_refresh_defaults_expiry_to_one_hour() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A2"}"#)
            .create_async()
            .await;

        let before = Utc::now().timestamp_millis();
        let tokens = engine(&server).refresh("R1").await.unwrap();
        assert!(tokens.access_token_expires_at >= before + DEFAULT_TOKEN_LIFETIME_MS);
    }

    #[tokio::test]
    async fn test_refresh_revoked_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
            .expect(1)
            .create_async()
            .await;

        let err = engine(&server).refresh("R1").await.unwrap_err();
        match err {
            RefreshFailure::Rejected {
                status,
                error,
                description,
            } => {
                assert_eq!(status, 400);
                assert_eq!(error, "invalid_grant");
                assert_eq!(
                    description.as_deref(),
                    Some("Token has been expired or revoked.")
                );
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        // no retry
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_non_json_error_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let err = engine(&server).refresh("R1").await.unwrap_err();
        assert!(matches!(
            err,
            RefreshFailure::Rejected { status: 503, ref error, .. } if error == "upstream unavailable"
        ));
    }

    #[tokio::test]
    async fn test_refresh_malformed_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = engine(&server).refresh("R1").await.unwrap_err();
        assert!(matches!(err, RefreshFailure::Malformed(_)));
    }

    #[tokio::test]
    async fn test_refresh_empty_access_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":""}"#)
            .create_async()
            .await;

        let err = engine(&server).refresh("R1").await.unwrap_err();
        assert!(matches!(err, RefreshFailure::Malformed(_)));
    }

    #[tokio::test]
    async fn test_refresh_empty_token_skips_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .expect(0)
            .create_async()
            .await;

        let err = engine(&server).refresh("").await.unwrap_err();
        assert!(matches!(err, RefreshFailure::MissingRefreshToken));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_expiry_out_of_range() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A2","expires_in":9223372036854775807}"#)
            .create_async()
            .await;

        let err = engine(&server).refresh("R1").await.unwrap_err();
        assert!(matches!(err, RefreshFailure::Malformed(_)));
    }

    #[tokio::test]
    async fn test_refresh_timeout() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_millis(1500));
                w.write_all(br#"{"access_token":"late"}"#)
            })
            .create_async()
            .await;

        let engine =
            RefreshClient::new(&provider_for(&server.url()), Duration::from_millis(300)).unwrap();
        let err = engine.refresh("R1").await.unwrap_err();
        assert!(matches!(err, RefreshFailure::Timeout(d) if d == Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn test_refresh_network_failure() {
        let provider = provider_for("http://127.0.0.1:1");
        let engine = RefreshClient::new(&provider, Duration::from_secs(2)).unwrap();

        let err = engine.refresh("R1").await.unwrap_err();
        assert!(matches!(
            err,
            RefreshFailure::Network(_) | RefreshFailure::Timeout(_)
        ));
    }
}
