// Encrypted, client-held session token

use anyhow::Result;
use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, Key, SameSite};
use axum_extra::extract::PrivateCookieJar;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::types::CredentialRecord;

/// Cookie carrying the encoded session token
pub const SESSION_COOKIE_NAME: &str = "suite.session-token";

/// Short-lived cookie carrying the sign-in `state` and return path
pub const OAUTH_STATE_COOKIE_NAME: &str = "suite.oauth-state";

/// Largest payload kept in one cookie. Encryption and percent-encoding grow
/// it by roughly 40%, which keeps each cookie under the 4096-byte limit.
const SESSION_CHUNK_LEN: usize = 2700;

/// How long a sign-in attempt may take before its state expires
const OAUTH_STATE_TTL_MINUTES: i64 = 10;

/// Session token payload: the live credential record plus the session's own lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    #[serde(rename = "rec")]
    pub record: CredentialRecord,
    /// Issued at, milliseconds since epoch
    pub iat: i64,
    /// Session expiry, milliseconds since epoch
    pub exp: i64,
}

impl SessionToken {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.exp
    }

    /// Same session lineage with a replacement record
    pub fn with_record(&self, record: CredentialRecord) -> Self {
        Self {
            record,
            iat: self.iat,
            exp: self.exp,
        }
    }
}

/// State stored between `/auth/signin` and `/auth/callback`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    /// Relative path to return to after sign-in
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Credential store backed by an encrypted cookie.
///
/// The cookie value is the base64url-encoded JSON of a [`SessionToken`],
/// encrypted and authenticated (AES-256-GCM) with a key derived from the
/// session secret. A payload too large for one cookie is split across
/// `suite.session-token.0`, `.1`, ... and reassembled on read. A token that
/// fails to decrypt, an unreadable payload or an elapsed max-age is treated
/// as absent.
#[derive(Clone)]
pub struct SessionStore {
    key: Key,
    max_age: chrono::Duration,
    secure: bool,
}

impl SessionStore {
    pub fn new(secret: &[u8], max_age: chrono::Duration, secure: bool) -> Result<Self> {
        let key = Key::try_from(secret)
            .map_err(|e| anyhow::anyhow!("Invalid session secret: {}", e))?;

        Ok(Self {
            key,
            max_age,
            secure,
        })
    }

    pub fn key(&self) -> Key {
        self.key.clone()
    }

    pub fn jar_from_headers(&self, headers: &HeaderMap) -> PrivateCookieJar {
        PrivateCookieJar::from_headers(headers, self.key.clone())
    }

    /// Start a new session lineage for a record
    pub fn issue(&self, record: CredentialRecord, now_ms: i64) -> SessionToken {
        SessionToken {
            record,
            iat: now_ms,
            exp: now_ms + self.max_age.num_milliseconds(),
        }
    }

    /// Encode and encrypt the token into the jar, replacing any previous
    /// session cookies
    pub fn seal(
        &self,
        jar: PrivateCookieJar,
        token: &SessionToken,
        now_ms: i64,
    ) -> Result<PrivateCookieJar> {
        let value = encode_payload(token)?;
        let max_age = time::Duration::milliseconds((token.exp - now_ms).max(0));

        let mut jar = self.clear(jar);

        if value.len() <= SESSION_CHUNK_LEN {
            return Ok(jar.add(self.session_cookie(SESSION_COOKIE_NAME.to_string(), value, max_age)));
        }

        let chunks = split_chunks(&value, SESSION_CHUNK_LEN);
        tracing::debug!(
            subject = %token.record.subject_id,
            chunks = chunks.len(),
            "Session token split across cookies"
        );

        for (index, chunk) in chunks.into_iter().enumerate() {
            jar = jar.add(self.session_cookie(chunk_name(index), chunk.to_string(), max_age));
        }

        Ok(jar)
    }

    fn session_cookie(
        &self,
        name: String,
        value: String,
        max_age: time::Duration,
    ) -> Cookie<'static> {
        Cookie::build((name, value))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(max_age)
            .build()
    }

    /// Decrypt and decode the session token, if any
    pub fn open(&self, jar: &PrivateCookieJar, now_ms: i64) -> Option<SessionToken> {
        // `get` only returns cookies that decrypt with our key
        let value = match jar.get(SESSION_COOKIE_NAME) {
            Some(cookie) => cookie.value().to_string(),
            None => {
                let chunks: Vec<_> = (0..).map_while(|i| jar.get(&chunk_name(i))).collect();
                if chunks.is_empty() {
                    return None;
                }
                chunks.iter().map(|c| c.value()).collect::<String>()
            }
        };

        let token: SessionToken = match decode_payload(&value) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Discarding unreadable session token: {}", e);
                return None;
            }
        };

        if token.is_expired_at(now_ms) {
            tracing::debug!(
                subject = %token.record.subject_id,
                "Session max-age elapsed, discarding session token"
            );
            return None;
        }

        Some(token)
    }

    /// Drop every session cookie (sign-out). Provider tokens are not revoked.
    pub fn clear(&self, jar: PrivateCookieJar) -> PrivateCookieJar {
        let names: Vec<String> = jar
            .iter()
            .map(|cookie| cookie.name().to_string())
            .filter(|name| is_session_cookie_name(name))
            .collect();

        names.into_iter().fold(jar, |jar, name| {
            jar.remove(Cookie::build((name, "")).path("/"))
        })
    }

    pub fn put_oauth_state(
        &self,
        jar: PrivateCookieJar,
        state: &OAuthState,
    ) -> Result<PrivateCookieJar> {
        let value = encode_payload(state)?;

        let cookie = Cookie::build((OAUTH_STATE_COOKIE_NAME, value))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/auth")
            .max_age(time::Duration::minutes(OAUTH_STATE_TTL_MINUTES))
            .build();

        Ok(jar.add(cookie))
    }

    /// Read and remove the sign-in state in one step
    pub fn take_oauth_state(&self, jar: PrivateCookieJar) -> (PrivateCookieJar, Option<OAuthState>) {
        let state = jar
            .get(OAUTH_STATE_COOKIE_NAME)
            .and_then(|cookie| decode_payload::<OAuthState>(cookie.value()).ok());

        let jar = jar.remove(Cookie::build(OAUTH_STATE_COOKIE_NAME).path("/auth"));
        (jar, state)
    }
}

fn chunk_name(index: usize) -> String {
    format!("{}.{}", SESSION_COOKIE_NAME, index)
}

/// The single session cookie or one of its numbered chunks
pub fn is_session_cookie_name(name: &str) -> bool {
    match name.strip_prefix(SESSION_COOKIE_NAME) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// Payloads are base64url, so byte offsets are always char boundaries
fn split_chunks(value: &str, len: usize) -> Vec<&str> {
    (0..value.len())
        .step_by(len)
        .map(|start| &value[start..(start + len).min(value.len())])
        .collect()
}

fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_payload<T: DeserializeOwned>(value: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD.decode(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}
