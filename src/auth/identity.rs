// Identity token claim decoding (display only, no signature verification)

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity token present but unreadable. Never fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityTokenError {
    #[error("identity token is not a three-part JWT")]
    NotAJwt,

    #[error("identity token payload is not valid base64url")]
    Encoding,

    #[error("identity token payload is not valid JSON: {0}")]
    Payload(String),
}

/// Claims of interest from a federated identity assertion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// A single audience or a list of audiences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Tenant id of the federated directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// Object id of the user in the federated directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Decode the payload segment of a JWT without verifying it.
///
/// Only for showing token details; nothing here is trusted for authorization.
pub fn decode_claims(token: &str) -> Result<IdentityClaims, IdentityTokenError> {
    let mut parts = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(IdentityTokenError::NotAJwt);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| IdentityTokenError::Encoding)?;

    serde_json::from_slice(&bytes).map_err(|e| IdentityTokenError::Payload(e.to_string()))
}
