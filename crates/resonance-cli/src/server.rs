//! HTTP surface for `resonance serve`.
//!
//! Failures leave the process only as a [`PublicRejection`]; the detailed error kind
//! is logged and dropped here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE, RETRY_AFTER, SET_COOKIE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use resonance_api::{AuthError, Identity, PublicRejection, TokenPair};
use resonance_auth::{RateDecision, RegisterRequest, Unauthenticated};
use resonance_runtime::{AuthRuntime, Session};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

type Shared = Arc<AuthRuntime>;

pub fn router(runtime: Shared) -> Router {
    let api = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/oauth2/callback", get(oauth2_callback))
        .merge(gated(runtime.clone()))
        .layer(middleware::from_fn_with_state(runtime.clone(), rate_limit));

    Router::new()
        .nest("/api", api)
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Routes that only run for an authenticated caller.
fn gated(runtime: Shared) -> Router<Shared> {
    Router::new()
        .route("/me", get(me))
        .route_layer(middleware::from_fn_with_state(runtime, require_identity))
}

/// Generic rejection rendered to clients.
#[derive(Debug)]
pub struct ApiError(PublicRejection);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        if err.is_transient() {
            tracing::warn!(kind = err.kind(), error = %err, "request failed on a dependency");
        } else {
            tracing::debug!(kind = err.kind(), error = %err, "request rejected");
        }
        Self(err.public_rejection())
    }
}

impl From<Unauthenticated> for ApiError {
    fn from(_: Unauthenticated) -> Self {
        Self(PublicRejection::Unauthorized)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({"error": self.0, "title": self.0.title()}));
        let mut resp = (status, body).into_response();
        if self.0 == PublicRejection::Unauthorized {
            resp.headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        resp
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    /// Username or email.
    #[serde(alias = "username", alias = "email")]
    login: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct LogoutRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "service": "resonance" }))
}

async fn register(
    State(rt): State<Shared>,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let session = rt.register(&req).await?;
    Ok(session_response(&rt, StatusCode::CREATED, &session))
}

async fn login(
    State(rt): State<Shared>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let session = rt.login(&req.login, &req.password).await?;
    Ok(session_response(&rt, StatusCode::OK, &session))
}

async fn oauth2_callback(
    State(rt): State<Shared>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = query.error {
        return Err(AuthError::ProviderRejected(error).into());
    }
    let code = query
        .code
        .ok_or_else(|| AuthError::Validation("missing code parameter".to_string()))?;
    let session = rt.oauth2_login(&code).await?;
    Ok(session_response(&rt, StatusCode::OK, &session))
}

async fn refresh(
    State(rt): State<Shared>,
    Json(req): Json<RefreshRequest>,
) -> Result<Response, ApiError> {
    let pair = rt.refresh(&req.refresh_token).await?;
    let cookie = rt.session_cookie(&pair);
    Ok(with_cookie((StatusCode::OK, Json::<TokenPair>(pair)).into_response(), cookie))
}

async fn logout(
    State(rt): State<Shared>,
    Json(req): Json<LogoutRequest>,
) -> Result<Response, ApiError> {
    rt.logout(&req.token).await?;
    Ok(with_cookie(StatusCode::NO_CONTENT.into_response(), rt.clear_cookie()))
}

async fn me(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

/// Resolves the caller from the bearer header or the session cookie and hands the
/// [`Identity`] to the handler as a request extension.
async fn require_identity(
    State(rt): State<Shared>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = {
        let headers = req.headers();
        rt.authenticate(header_str(headers, &AUTHORIZATION), header_str(headers, &COOKIE))?
    };
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn rate_limit(State(rt): State<Shared>, req: Request, next: Next) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());

    match rt.check_rate(&client) {
        RateDecision::Allowed { .. } => next.run(req).await,
        RateDecision::Limited { retry_after } => {
            tracing::debug!(client = %client, "rate limited");
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "too_many_requests", "title": "Too Many Requests"})),
            )
                .into_response();
            resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
            resp
        }
    }
}

fn session_response(rt: &AuthRuntime, status: StatusCode, session: &Session) -> Response {
    let cookie = rt.session_cookie(&session.tokens);
    with_cookie((status, Json(session)).into_response(), cookie)
}

fn with_cookie(mut resp: Response, cookie: Option<String>) -> Response {
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        resp.headers_mut().append(SET_COOKIE, value);
    }
    resp
}
