// Session lifecycle: reuse, refresh, or mark the credential record as errored

use chrono::Utc;
use std::sync::Arc;

use super::refresh::RefreshClient;
use super::types::{CredentialRecord, InitialGrant, TokenStatus, DEFAULT_TOKEN_LIFETIME_MS};

/// Tokens within this window of their expiry count as expired (5 minutes)
pub const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

/// True when `expires_at_ms` is already past, or within the safety buffer
pub fn is_token_expired(expires_at_ms: i64, now_ms: i64) -> bool {
    now_ms >= expires_at_ms.saturating_sub(EXPIRY_BUFFER_MS)
}

/// What triggered a materialization
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Sign-in just completed with a fresh provider grant
    SignIn(InitialGrant),
    /// Any later request carrying an existing record
    Access(CredentialRecord),
}

/// Outcome of one pass through the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Seeded from a sign-in grant
    Fresh,
    /// Access token still outside the safety buffer; record untouched
    Valid,
    /// Access token was expiring and has been replaced
    Refreshed,
    /// Refresh failed or was impossible; terminal until the next sign-in
    Errored,
}

#[derive(Debug, Clone)]
pub struct Materialized {
    pub record: CredentialRecord,
    pub state: SessionState,
    /// Whether the record differs from the one the trigger carried
    pub changed: bool,
}

/// Session Lifecycle Controller.
///
/// Runs synchronously on every session read, before any consumer sees the
/// credential. It is the only writer of session state: every mutation yields
/// a replacement record.
pub struct SessionController {
    refresher: Arc<RefreshClient>,
}

impl SessionController {
    pub fn new(refresher: Arc<RefreshClient>) -> Self {
        Self { refresher }
    }

    pub async fn materialize(&self, trigger: Trigger) -> Materialized {
        self.materialize_at(trigger, Utc::now().timestamp_millis())
            .await
    }

    pub async fn materialize_at(&self, trigger: Trigger, now_ms: i64) -> Materialized {
        let current = match trigger {
            Trigger::SignIn(grant) => return seed(grant, now_ms),
            Trigger::Access(record) => record,
        };

        if current.is_refresh_error() {
            tracing::debug!(
                subject = %current.subject_id,
                "Session carries a refresh error, skipping refresh"
            );
            return unchanged(current, SessionState::Errored);
        }

        if !is_token_expired(current.access_token_expires_at, now_ms) {
            tracing::debug!(subject = %current.subject_id, "Access token is still valid");
            return unchanged(current, SessionState::Valid);
        }

        let Some(refresh_token) = current.usable_refresh_token().map(str::to_string) else {
            tracing::warn!(
                subject = %current.subject_id,
                "Access token expired and no refresh token is available"
            );
            return errored(current);
        };

        tracing::info!(subject = %current.subject_id, "Access token expiring, refreshing...");

        let result = self.refresher.refresh(&refresh_token).await;
        match result {
            Ok(tokens) => {
                let record = CredentialRecord {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token.or(current.refresh_token),
                    identity_token: current.identity_token,
                    access_token_expires_at: tokens.access_token_expires_at,
                    status: TokenStatus::Valid,
                    subject_id: current.subject_id,
                };

                Materialized {
                    record,
                    state: SessionState::Refreshed,
                    changed: true,
                }
            }
            Err(e) => {
                tracing::error!(
                    subject = %current.subject_id,
                    "Error refreshing access token: {}",
                    e
                );
                errored(current)
            }
        }
    }
}

fn seed(grant: InitialGrant, now_ms: i64) -> Materialized {
    tracing::info!(
        subject = %grant.subject_id,
        has_refresh_token = grant.refresh_token.is_some(),
        has_identity_token = grant.identity_token.is_some(),
        "Initial sign in - storing tokens"
    );

    let record = CredentialRecord {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        identity_token: grant.identity_token,
        access_token_expires_at: grant
            .expires_at
            .unwrap_or(now_ms + DEFAULT_TOKEN_LIFETIME_MS),
        status: TokenStatus::Valid,
        subject_id: grant.subject_id,
    };

    Materialized {
        record,
        state: SessionState::Fresh,
        changed: true,
    }
}

fn unchanged(record: CredentialRecord, state: SessionState) -> Materialized {
    Materialized {
        record,
        state,
        changed: false,
    }
}

fn errored(current: CredentialRecord) -> Materialized {
    Materialized {
        record: CredentialRecord {
            status: TokenStatus::RefreshError,
            ..current
        },
        state: SessionState::Errored,
        changed: true,
    }
}
