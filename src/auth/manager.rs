use anyhow::Result;
use axum_extra::extract::PrivateCookieJar;
use chrono::Utc;
use std::sync::Arc;

use super::lifecycle::{SessionController, SessionState, Trigger};
use super::oauth::OAuthClient;
use super::refresh::RefreshClient;
use super::store::SessionStore;
use super::types::{InitialGrant, Session};
use crate::config::Config;

/// Authentication manager
/// Wires the credential store, lifecycle controller and provider clients
/// together for the request path. Holds no per-user state.
pub struct AuthManager {
    store: SessionStore,
    controller: SessionController,
    oauth: OAuthClient,
    refresher: Arc<RefreshClient>,
}

impl AuthManager {
    pub fn new(config: &Config) -> Result<Self> {
        let store = SessionStore::new(
            config.session_secret.as_bytes(),
            config.session_max_age(),
            config.secure_cookies,
        )?;

        let refresher = Arc::new(RefreshClient::new(
            &config.provider,
            config.refresh_timeout(),
        )?);

        let oauth = OAuthClient::new(
            config.provider.clone(),
            std::time::Duration::from_secs(config.http_request_timeout),
        )?;

        Ok(Self {
            store,
            controller: SessionController::new(refresher.clone()),
            oauth,
            refresher,
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    pub fn refresher(&self) -> Arc<RefreshClient> {
        self.refresher.clone()
    }

    /// Decode the session carried by the request and run it through the
    /// lifecycle controller. A changed record is resealed into the jar.
    pub async fn load_session(&self, jar: PrivateCookieJar) -> (PrivateCookieJar, Option<Session>) {
        let now = Utc::now().timestamp_millis();

        let Some(token) = self.store.open(&jar, now) else {
            return (jar, None);
        };

        let out = self
            .controller
            .materialize_at(Trigger::Access(token.record.clone()), now)
            .await;

        if out.state == SessionState::Refreshed {
            tracing::info!(subject = %out.record.subject_id, "Session refreshed");
        }

        let jar = if out.changed {
            match self.store.seal(jar.clone(), &token.with_record(out.record.clone()), now) {
                Ok(jar) => jar,
                Err(e) => {
                    tracing::error!("Failed to reseal session token: {}", e);
                    jar
                }
            }
        } else {
            jar
        };

        (jar, Some(Session::new(out.record)))
    }

    /// Decode the session carried by the request without running the
    /// lifecycle. Never calls the provider and never reseals.
    pub fn peek_session(&self, jar: &PrivateCookieJar) -> Option<Session> {
        let now = Utc::now().timestamp_millis();
        self.store
            .open(jar, now)
            .map(|token| Session::new(token.record))
    }

    /// Seed a new session lineage from a sign-in grant
    pub async fn sign_in(
        &self,
        jar: PrivateCookieJar,
        grant: InitialGrant,
    ) -> Result<(PrivateCookieJar, Session)> {
        let now = Utc::now().timestamp_millis();

        let out = self
            .controller
            .materialize_at(Trigger::SignIn(grant), now)
            .await;

        let token = self.store.issue(out.record, now);
        let jar = self.store.seal(jar, &token, now)?;

        Ok((jar, Session::new(token.record)))
    }

    /// Discard the local session token only
    pub fn sign_out(&self, jar: PrivateCookieJar) -> PrivateCookieJar {
        self.store.clear(jar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh::tests::provider_for;
    use crate::auth::types::{CredentialRecord, TokenStatus};
    use crate::config::ProtectedPaths;
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::{HeaderMap, HeaderValue};
    use axum::response::IntoResponse;

    fn config(server_url: &str) -> Config {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 3000,
            provider: provider_for(server_url),
            session_secret: "k".repeat(64),
            session_max_age_days: 30,
            secure_cookies: false,
            protected_paths: ProtectedPaths::new(["/dashboard"]),
            refresh_timeout: 5,
            http_connect_timeout: 5,
            http_request_timeout: 5,
            log_level: "debug".to_string(),
        }
    }

    fn replay(jar: PrivateCookieJar) -> HeaderMap {
        let response = (jar, "").into_response();
        let pairs: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().split(';').next().unwrap().to_string())
            .collect();
        let mut headers = HeaderMap::new();
        if !pairs.is_empty() {
            headers.insert(COOKIE, HeaderValue::from_str(&pairs.join("; ")).unwrap());
        }
        headers
    }

    fn seal_record(manager: &AuthManager, record: CredentialRecord) -> HeaderMap {
        let now = Utc::now().timestamp_millis();
        let token = manager.store().issue(record, now);
        let jar = manager
            .store()
            .seal(PrivateCookieJar::new(manager.store().key()), &token, now)
            .unwrap();
        replay(jar)
    }

    fn record(expires_at: i64) -> CredentialRecord {
        CredentialRecord {
            access_token: "A1".to_string(),
            refresh_token: Some("R1".to_string()),
            identity_token: Some("I1".to_string()),
            access_token_expires_at: expires_at,
            status: TokenStatus::Valid,
            subject_id: "user-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_load_session_without_cookie() {
        let server = mockito::Server::new_async().await;
        let manager = AuthManager::new(&config(&server.url())).unwrap();
        let jar = manager.store().jar_from_headers(&HeaderMap::new());

        let (_, session) = manager.load_session(jar).await;
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_load_valid_session_does_not_reseal() {
        let server = mockito::Server::new_async().await;
        let manager = AuthManager::new(&config(&server.url())).unwrap();
        let now = Utc::now().timestamp_millis();
        let headers = seal_record(&manager, record(now + 3_600_000));

        let (jar, session) = manager
            .load_session(manager.store().jar_from_headers(&headers))
            .await;

        assert_eq!(session.unwrap().record.access_token, "A1");
        let response = (jar, "").into_response();
        assert!(response.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_load_expired_session_refreshes_and_reseals() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let manager = AuthManager::new(&config(&server.url())).unwrap();
        let now = Utc::now().timestamp_millis();
        let headers = seal_record(&manager, record(now - 1));

        let (jar, session) = manager
            .load_session(manager.store().jar_from_headers(&headers))
            .await;
        let session = session.unwrap();
        assert_eq!(session.record.access_token, "A2");
        assert_eq!(session.record.refresh_token.as_deref(), Some("R1"));

        // the resealed cookie carries the refreshed record
        let replayed = replay(jar);
        let reopened = manager
            .store()
            .open(&manager.store().jar_from_headers(&replayed), now)
            .unwrap();
        assert_eq!(reopened.record, session.record);
    }

    #[tokio::test]
    async fn test_load_session_refresh_failure_keeps_session() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let manager = AuthManager::new(&config(&server.url())).unwrap();
        let now = Utc::now().timestamp_millis();
        let headers = seal_record(&manager, record(now - 1));

        let (_, session) = manager
            .load_session(manager.store().jar_from_headers(&headers))
            .await;
        let session = session.unwrap();
        assert_eq!(session.record.access_token, "A1");
        assert_eq!(session.error(), Some("RefreshAccessTokenError"));
    }

    #[tokio::test]
    async fn test_sign_in_issues_session() {
        let server = mockito::Server::new_async().await;
        let manager = AuthManager::new(&config(&server.url())).unwrap();
        let grant = InitialGrant {
            access_token: "A1".to_string(),
            refresh_token: Some("R1".to_string()),
            identity_token: Some("I1".to_string()),
            expires_at: None,
            subject_id: "user-1".to_string(),
        };

        let (jar, session) = manager
            .sign_in(PrivateCookieJar::new(manager.store().key()), grant)
            .await
            .unwrap();
        assert_eq!(session.user_id(), "user-1");

        let headers = replay(jar);
        let now = Utc::now().timestamp_millis();
        let token = manager
            .store()
            .open(&manager.store().jar_from_headers(&headers), now)
            .unwrap();
        assert_eq!(token.record.identity_token.as_deref(), Some("I1"));
        assert!(token.exp > now + 29 * 24 * 3600 * 1000);
    }

    #[tokio::test]
    async fn test_peek_session_skips_refresh() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A2","expires_in":3600}"#)
            .expect(0)
            .create_async()
            .await;

        let manager = AuthManager::new(&config(&server.url())).unwrap();
        let now = Utc::now().timestamp_millis();
        let headers = seal_record(&manager, record(now - 1));

        let session = manager
            .peek_session(&manager.store().jar_from_headers(&headers))
            .unwrap();
        assert_eq!(session.record.access_token, "A1");
        assert!(session.error().is_none());
        assert!(manager
            .peek_session(&manager.store().jar_from_headers(&HeaderMap::new()))
            .is_none());
        mock.assert_async().await;
    }
}
