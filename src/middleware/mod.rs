// Session materialization, access gate, and CORS middleware

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{header::SET_COOKIE, request::Parts, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tower_http::cors::{Any, CorsLayer};

use crate::auth::store::is_session_cookie_name;
use crate::auth::Session;
use crate::config::{ProtectedPaths, SIGN_IN_PATH};
use crate::error::ApiError;
use crate::routes::AppState;

const AUTH_PATH_PREFIX: &str = "/auth/";

/// Session materialization middleware
///
/// Decodes the encrypted session cookie, runs it through the lifecycle
/// controller and exposes the result to handlers as a [`Session`] request
/// extension. A record changed by a refresh is written back as a new
/// Set-Cookie on the way out. Paths under `/auth/` only decode the cookie.
pub async fn session_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let jar = state.auth.store().jar_from_headers(request.headers());

    // Sign-in, callback and sign-out manage the cookie themselves
    if request.uri().path().starts_with(AUTH_PATH_PREFIX) {
        if let Some(session) = state.auth.peek_session(&jar) {
            request.extensions_mut().insert(session);
        }
        return next.run(request).await;
    }

    let (jar, session) = state.auth.load_session(jar).await;

    if let Some(session) = session {
        tracing::debug!(
            subject = %session.user_id(),
            error = ?session.error(),
            path = %request.uri().path(),
            "Session materialized"
        );
        request.extensions_mut().insert(session);
    }

    let response = next.run(request).await;

    // Handlers that issue or discard the session own the cookie
    if sets_session_cookie(response.headers()) {
        return response;
    }

    (jar, response).into_response()
}

fn sets_session_cookie(headers: &HeaderMap) -> bool {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split_once('=').map(|(name, _)| name.trim()))
        .any(is_session_cookie_name)
}

/// Outcome of the access gate for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { redirect: String },
}

/// Decide whether a request may proceed.
///
/// Only configured paths are checked. The gate tests presence of a session,
/// not freshness: a session carrying a refresh error is let through and
/// collaborators reject it themselves.
pub fn evaluate_gate(
    protected: &ProtectedPaths,
    path: &str,
    session: Option<&Session>,
) -> GateDecision {
    if !protected.matches(path) || session.is_some() {
        return GateDecision::Allow;
    }

    let callback: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
    GateDecision::Deny {
        redirect: format!("{}?callbackUrl={}", SIGN_IN_PATH, callback),
    }
}

/// Access gate middleware. Must run inside [`session_middleware`].
pub async fn access_gate(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let decision = evaluate_gate(
        &state.config.protected_paths,
        request.uri().path(),
        request.extensions().get::<Session>(),
    );

    match decision {
        GateDecision::Allow => next.run(request).await,
        GateDecision::Deny { redirect } => {
            tracing::warn!(
                method = %request.method(),
                path = %request.uri().path(),
                "Protected path requested without a session, redirecting to sign-in"
            );
            Redirect::to(&redirect).into_response()
        }
    }
}

/// Materialized session of the current request
///
/// Rejects with 401 when the request carries no session. Handlers that talk
/// to the provider still have to call [`Session::require_valid`].
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .map(CurrentSession)
            .ok_or_else(|| ApiError::AuthError("Unauthorized - No valid session".to_string()))
    }
}

/// Create CORS middleware layer
///
/// Configures CORS to allow all origins, methods, and headers.
/// Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
