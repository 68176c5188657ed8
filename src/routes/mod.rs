use axum::{
    extract::{FromRef, Query, State},
    middleware::{self as axum_middleware},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use axum_extra::extract::cookie::Key;
use axum_extra::extract::PrivateCookieJar;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::identity::{decode_claims, IdentityClaims};
use crate::auth::store::OAuthState;
use crate::auth::{AuthManager, InitialGrant, Session};
use crate::config::{Config, SIGN_IN_PATH};
use crate::error::ApiError;
use crate::http_client::{ClientFactory, RotatedTokens, TokenObserver};
use crate::middleware::{self, CurrentSession};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Landing page after a successful sign-in without a callback URL
const DEFAULT_AFTER_SIGN_IN: &str = "/dashboard";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub clients: Arc<ClientFactory>,
    pub config: Arc<Config>,
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.auth.store().key()
    }
}

/// Build the application router.
///
/// Layer order matters: the session middleware wraps the access gate so the
/// gate always sees the materialized session.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(auth_routes())
        .merge(api_routes())
        .merge(dashboard_routes())
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::access_gate,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::session_middleware,
        ))
        .with_state(state)
}

/// Health check routes (no session required)
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Sign-in, provider callback and sign-out
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signin", get(sign_in_handler))
        .route("/auth/callback", get(callback_handler))
        .route(
            "/auth/signout",
            get(sign_out_handler).post(sign_out_handler),
        )
}

/// Session inspection and provider pass-through
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/session", get(session_handler))
        .route("/api/session/tokens", get(token_details_handler))
        .route("/api/userinfo", get(userinfo_handler))
}

pub fn dashboard_routes() -> Router<AppState> {
    Router::new().route("/dashboard", get(dashboard_handler))
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Suite Gateway is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInParams {
    callback_url: Option<String>,
    error: Option<String>,
}

/// GET /auth/signin - Start the authorization-code flow
///
/// When reached with `?error=` (a failed callback) the error is reported
/// instead of restarting the flow.
async fn sign_in_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Query(params): Query<SignInParams>,
) -> Result<Response, ApiError> {
    if let Some(error) = params.error {
        return Err(ApiError::AuthError(format!("Sign-in failed: {}", error)));
    }

    let oauth_state = OAuthState {
        state: Uuid::new_v4().to_string(),
        callback_url: params.callback_url.and_then(|url| safe_callback_url(&url)),
    };

    let jar = state.auth.store().put_oauth_state(jar, &oauth_state)?;
    let location = state.auth.oauth().authorization_url(&oauth_state.state);

    tracing::info!(
        callback_url = ?oauth_state.callback_url,
        "Redirecting to identity provider for sign-in"
    );

    Ok((jar, Redirect::to(&location)).into_response())
}

/// Only same-origin relative paths are honoured as post-sign-in targets
fn safe_callback_url(url: &str) -> Option<String> {
    let is_relative = url.starts_with('/') && !url.starts_with("//") && !url.contains('\\');
    is_relative.then(|| url.to_string())
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

fn sign_in_error(jar: PrivateCookieJar, code: &str) -> Response {
    (
        jar,
        Redirect::to(&format!("{}?error={}", SIGN_IN_PATH, code)),
    )
        .into_response()
}

/// GET /auth/callback - Complete the authorization-code flow
///
/// Exchanges the code, seeds the session from the provider grant and seals
/// it into the session cookie.
async fn callback_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    let (jar, stored) = state.auth.store().take_oauth_state(jar);

    if let Some(error) = params.error {
        tracing::warn!(
            error = %error,
            description = ?params.error_description,
            "Identity provider returned an error to the callback"
        );
        return Ok(sign_in_error(jar, "provider_error"));
    }

    let Some(stored) = stored.filter(|s| params.state.as_deref() == Some(s.state.as_str())) else {
        tracing::warn!("Sign-in callback with missing or mismatched state");
        return Ok(sign_in_error(jar, "state_mismatch"));
    };

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return Ok(sign_in_error(jar, "missing_code"));
    };

    let grant = match state.auth.oauth().exchange_code(&code).await {
        Ok(grant) => grant,
        Err(e) => {
            tracing::error!("Authorization code exchange failed: {}", e);
            return Ok(sign_in_error(jar, "exchange_failed"));
        }
    };

    let subject_id = match subject_from_identity_token(grant.id_token.as_deref()) {
        Some(sub) => sub,
        None => match state.auth.oauth().get_user_info(&grant.access_token).await {
            Ok(info) => info.sub,
            Err(e) => {
                tracing::error!("Could not determine the signed-in user: {}", e);
                return Ok(sign_in_error(jar, "no_subject"));
            }
        },
    };

    let now = Utc::now().timestamp_millis();
    let expires_at = match grant.expires_at_ms(now) {
        Ok(expires_at) => expires_at,
        Err(e) => {
            tracing::error!("Provider grant rejected: {}", e);
            return Ok(sign_in_error(jar, "malformed_grant"));
        }
    };

    let initial = InitialGrant {
        expires_at,
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        identity_token: grant.id_token,
        subject_id,
    };

    let (jar, session) = state.auth.sign_in(jar, initial).await?;
    tracing::info!(
        subject = %session.user_id(),
        has_refresh_token = session.record.refresh_token.is_some(),
        "Sign-in complete, session issued"
    );

    let target = stored
        .callback_url
        .unwrap_or_else(|| DEFAULT_AFTER_SIGN_IN.to_string());
    Ok((jar, Redirect::to(&target)).into_response())
}

fn subject_from_identity_token(token: Option<&str>) -> Option<String> {
    let claims = decode_claims(token?).ok()?;
    claims.sub.filter(|s| !s.is_empty())
}

/// GET|POST /auth/signout - Discard the local session
///
/// Provider tokens are not revoked.
async fn sign_out_handler(
    State(state): State<AppState>,
    session: Option<CurrentSession>,
    jar: PrivateCookieJar,
) -> Response {
    if let Some(CurrentSession(session)) = session {
        tracing::info!(subject = %session.user_id(), "Signing out");
    }

    (state.auth.sign_out(jar), Redirect::to("/")).into_response()
}

/// GET /api/session - Session fields exposed to collaborators
async fn session_handler(CurrentSession(session): CurrentSession) -> Json<Value> {
    Json(json!(session.view()))
}

/// Presence summary for one token; never carries the token itself
#[derive(Debug, Serialize)]
struct TokenPresence {
    present: bool,
    length: usize,
}

impl TokenPresence {
    fn of(token: Option<&str>) -> Self {
        let token = token.unwrap_or_default();
        Self {
            present: !token.is_empty(),
            length: token.len(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenDetails {
    user_id: String,
    error: Option<String>,
    access_token: TokenPresence,
    refresh_token: TokenPresence,
    id_token: TokenPresence,
    access_token_expires_at: i64,
    identity_claims: Option<IdentityClaims>,
    identity_error: Option<String>,
}

fn token_details(session: &Session) -> TokenDetails {
    let record = &session.record;

    let (identity_claims, identity_error) = match record.identity_token.as_deref() {
        None => (None, None),
        Some(token) => match decode_claims(token) {
            Ok(claims) => (Some(claims), None),
            Err(e) => {
                tracing::warn!(subject = %record.subject_id, "Identity token not decodable: {}", e);
                (None, Some(e.to_string()))
            }
        },
    };

    TokenDetails {
        user_id: record.subject_id.clone(),
        error: session.error().map(str::to_string),
        access_token: TokenPresence::of(Some(record.access_token.as_str())),
        refresh_token: TokenPresence::of(record.refresh_token.as_deref()),
        id_token: TokenPresence::of(record.identity_token.as_deref()),
        access_token_expires_at: record.access_token_expires_at,
        identity_claims,
        identity_error,
    }
}

/// GET /api/session/tokens - Token summary and decoded identity claims
///
/// A malformed identity token only affects the claims section.
async fn token_details_handler(CurrentSession(session): CurrentSession) -> Json<Value> {
    let details = token_details(&session);
    Json(json!({
        "success": true,
        "tokens": details
    }))
}

/// GET /api/userinfo - Provider userinfo through an authenticated client
async fn userinfo_handler(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<Value>, ApiError> {
    let record = session.require_valid()?;

    let subject = record.subject_id.clone();
    let observer: TokenObserver = Arc::new(move |tokens: &RotatedTokens| {
        tracing::debug!(
            subject = %subject,
            expires_at = tokens.access_token_expires_at,
            "Rotated tokens observed, session keeps its stored values"
        );
    });

    let client = state.clients.build_client(
        &record.access_token,
        record.refresh_token.as_deref(),
        Some(observer),
    );

    let info: Value = client
        .get_json(state.config.provider.userinfo_url.as_str())
        .await?;

    Ok(Json(json!({
        "success": true,
        "userinfo": info
    })))
}

/// GET /dashboard - Protected summary of the current session
async fn dashboard_handler(CurrentSession(session): CurrentSession) -> Json<Value> {
    let record = &session.record;
    let mut body = json!({
        "user": { "id": record.subject_id },
        "status": record.status,
        "error": session.error(),
        "accessTokenExpiresAt": record.access_token_expires_at,
        "hasRefreshToken": record.usable_refresh_token().is_some(),
        "hasIdToken": record.identity_token.is_some(),
    });

    // An errored session needs a fresh sign-in before any provider call
    if record.is_refresh_error() {
        body["signInUrl"] = json!(format!("{}?callbackUrl=%2Fdashboard", SIGN_IN_PATH));
    }

    Json(body)
}
