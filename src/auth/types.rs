// Authentication types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApiError;

/// Lifetime assumed when the provider omits expiry information (1 hour)
pub const DEFAULT_TOKEN_LIFETIME_MS: i64 = 3600 * 1000;

/// Error code exposed to collaborators once a refresh has failed
pub const REFRESH_ERROR_CODE: &str = "RefreshAccessTokenError";

/// Health of the credential record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Valid,
    /// Sticky: no refresh is attempted again until a fresh sign-in
    RefreshError,
}

/// The unit carried by the session token.
///
/// Replaced wholesale on every mutation; `identity_token` and `subject_id`
/// survive refreshes untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub identity_token: Option<String>,
    /// Absolute expiry, milliseconds since epoch
    pub access_token_expires_at: i64,
    pub status: TokenStatus,
    pub subject_id: String,
}

impl CredentialRecord {
    pub fn is_refresh_error(&self) -> bool {
        self.status == TokenStatus::RefreshError
    }

    /// Error string exposed to collaborators, absent while valid
    pub fn error(&self) -> Option<&'static str> {
        match self.status {
            TokenStatus::Valid => None,
            TokenStatus::RefreshError => Some(REFRESH_ERROR_CODE),
        }
    }

    /// Refresh token eligible for an exchange (present and non-empty)
    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Provider grant captured when sign-in completes
#[derive(Debug, Clone)]
pub struct InitialGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub identity_token: Option<String>,
    /// Absolute expiry in milliseconds, if the provider reported one
    pub expires_at: Option<i64>,
    pub subject_id: String,
}

/// Result of a successful refresh exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Absolute expiry, milliseconds since epoch
    pub access_token_expires_at: i64,
    /// Present only when the provider rotated the refresh token
    pub refresh_token: Option<String>,
}

/// Standard OAuth2 token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiry in seconds since epoch (some providers send this instead)
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl TokenEndpointResponse {
    /// Absolute expiry in milliseconds; `expires_at` wins over `expires_in`.
    /// `Ok(None)` when the provider sent neither.
    pub fn expires_at_ms(&self, now_ms: i64) -> Result<Option<i64>, ExpiryOutOfRange> {
        if let Some(secs) = self.expires_at {
            return secs.checked_mul(1000).map(Some).ok_or(ExpiryOutOfRange);
        }

        match self.expires_in {
            Some(secs) => secs
                .checked_mul(1000)
                .and_then(|ms| now_ms.checked_add(ms))
                .map(Some)
                .ok_or(ExpiryOutOfRange),
            None => Ok(None),
        }
    }
}

/// Provider-reported expiry that does not fit a millisecond timestamp
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("token expiry is out of range")]
pub struct ExpiryOutOfRange;

/// OAuth2 error body (`error`, `error_description`)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Materialized session handed to request handlers
#[derive(Debug, Clone)]
pub struct Session {
    pub record: CredentialRecord,
}

impl Session {
    pub fn new(record: CredentialRecord) -> Self {
        Self { record }
    }

    pub fn user_id(&self) -> &str {
        &self.record.subject_id
    }

    pub fn error(&self) -> Option<&'static str> {
        self.record.error()
    }

    /// Contract every downstream collaborator honours before calling out:
    /// a session carrying a refresh error is rejected without a round-trip.
    pub fn require_valid(&self) -> Result<&CredentialRecord, ApiError> {
        if self.record.is_refresh_error() {
            return Err(ApiError::SessionExpired(
                "Session expired. Please sign in again.".to_string(),
            ));
        }
        if self.record.access_token.is_empty() {
            return Err(ApiError::AuthError(
                "Unauthorized - No valid session".to_string(),
            ));
        }
        Ok(&self.record)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            access_token: self.record.access_token.clone(),
            refresh_token: self.record.refresh_token.clone(),
            id_token: self.record.identity_token.clone(),
            access_token_expires_at: self.record.access_token_expires_at,
            error: self.error().map(str::to_string),
            user: SessionUser {
                id: self.record.subject_id.clone(),
            },
        }
    }
}

/// Session fields exposed to collaborators
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub access_token_expires_at: i64,
    pub error: Option<String>,
    pub user: SessionUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUser {
    pub id: String,
}
