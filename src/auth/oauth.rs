// Sign-in: authorization redirect and authorization-code exchange

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::types::{OAuthErrorBody, TokenEndpointResponse};
use crate::config::ProviderSettings;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("{operation} request failed: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} rejected by provider: {status} {detail}")]
    Provider {
        operation: &'static str,
        status: u16,
        detail: String,
    },
}

/// Subset of the OpenID userinfo response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// OAuth2 client for the initial authorization-code grant
pub struct OAuthClient {
    provider: ProviderSettings,
    http: Client,
}

impl OAuthClient {
    pub fn new(provider: ProviderSettings, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { provider, http })
    }

    /// Authorization URL requesting offline access so a refresh token is issued
    pub fn authorization_url(&self, state: &str) -> String {
        let scope = self.provider.scopes.join(" ");

        let mut url = self.provider.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.provider.client_id)
            .append_pair("redirect_uri", self.provider.redirect_uri.as_str())
            .append_pair("scope", &scope)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);

        url.into()
    }

    /// Exchange an authorization code for the initial grant
    pub async fn exchange_code(&self, code: &str) -> Result<TokenEndpointResponse, OAuthError> {
        const OPERATION: &str = "token exchange";

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.provider.redirect_uri.as_str()),
            ("client_id", self.provider.client_id.as_str()),
            ("client_secret", self.provider.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(self.provider.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|source| OAuthError::Http {
                operation: OPERATION,
                source,
            })?;

        let response = ensure_success(response, OPERATION).await?;
        response
            .json::<TokenEndpointResponse>()
            .await
            .map_err(|source| OAuthError::Http {
                operation: OPERATION,
                source,
            })
    }

    /// Fetch the OpenID userinfo document for an access token
    pub async fn get_user_info(&self, access_token: &str) -> Result<UserInfo, OAuthError> {
        const OPERATION: &str = "userinfo";

        let response = self
            .http
            .get(self.provider.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|source| OAuthError::Http {
                operation: OPERATION,
                source,
            })?;

        let response = ensure_success(response, OPERATION).await?;
        response
            .json::<UserInfo>()
            .await
            .map_err(|source| OAuthError::Http {
                operation: OPERATION,
                source,
            })
    }
}

async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, OAuthError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<OAuthErrorBody>(&body) {
        Ok(err) => match err.error_description {
            Some(desc) => format!("{}: {}", err.error, desc),
            None => err.error,
        },
        Err(_) => body,
    };

    Err(OAuthError::Provider {
        operation,
        status,
        detail,
    })
}
