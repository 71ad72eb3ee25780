//! HTTP and WebSocket front end
//!
//! Thin handlers over the session registry and terminal bridge, plus the
//! CORS policy browsers need to call them from another origin.

use crate::{bridge::Bridge, errors::SessionError, session::SessionRegistry};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use sandterm_protocol::{
    error_code, terminal_url, Ack, ErrorBody, SessionCreated, SessionRequest, TerminalParams,
    TERMINAL_PATH,
};
use std::{net::SocketAddr, sync::Arc};

/// Which browser origins may call the API
#[derive(Debug, Clone)]
pub struct AllowedOrigins(Vec<String>);

impl AllowedOrigins {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowedOrigins(origins.into_iter().map(Into::into).collect())
    }

    /// Allow every origin
    pub fn any() -> Self {
        AllowedOrigins::new(["*"])
    }

    /// Parse a comma separated list, ignoring blanks
    pub fn parse(list: &str) -> Self {
        AllowedOrigins::new(
            list.split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty()),
        )
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are always allowed
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self.0.iter().any(|o| o == "*" || o == origin),
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
    bridge: Arc<Bridge>,
    origins: Arc<AllowedOrigins>,
}

/// Build the router serving the session API and terminal connections
pub fn router(
    registry: Arc<SessionRegistry>,
    bridge: Arc<Bridge>,
    origins: AllowedOrigins,
) -> Router {
    let state = AppState {
        registry,
        bridge,
        origins: Arc::new(origins),
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/terminal/session", post(create_session))
        .route("/terminal/heartbeat", post(heartbeat))
        .route("/terminal/close", post(close_session))
        .route(TERMINAL_PATH, get(terminal))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let preflight = request.method() == Method::OPTIONS;

    let mut response = if preflight {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if state.origins.allows(origin.as_deref()) {
        let allow = origin
            .as_deref()
            .and_then(|origin| HeaderValue::from_str(origin).ok())
            .unwrap_or_else(|| HeaderValue::from_static("*"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

fn error(status: StatusCode, code: &str) -> Response {
    (status, Json(ErrorBody::new(code))).into_response()
}

/// Identity used for per-origin limits: the first forwarded address if a
/// proxy supplied one, otherwise the peer address
fn origin_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn healthz() -> Json<Ack> {
    Json(Ack::default())
}

async fn create_session(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let origin = origin_identity(request.headers(), peer);

    match state.registry.create_session(&origin).await {
        Ok(session) => Json(SessionCreated {
            ws_url: terminal_url(session.session_id.as_str(), session.secret()),
            session_id: session.session_id.to_string(),
            expires_in_seconds: state.registry.limits().idle_timeout.as_secs(),
        })
        .into_response(),
        Err(err) => {
            log::error!("session creation for {} failed, {}", origin, err);
            match err {
                SessionError::GlobalCapacityExceeded => error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    error_code::MAX_CONCURRENT_SESSIONS,
                ),
                SessionError::OriginCapacityExceeded => error(
                    StatusCode::TOO_MANY_REQUESTS,
                    error_code::MAX_SESSIONS_PER_IP,
                ),
                SessionError::ShuttingDown => {
                    error(StatusCode::SERVICE_UNAVAILABLE, error_code::SHUTTING_DOWN)
                }
                SessionError::ContainerCreationFailed(_) => error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_code::SESSION_CREATION_FAILED,
                ),
            }
        }
    }
}

async fn heartbeat(State(state): State<AppState>, body: Bytes) -> Response {
    let request = SessionRequest::from_body(&body);
    let session_id = match request.session_id() {
        Some(id) => id,
        None => return error(StatusCode::BAD_REQUEST, error_code::MISSING_SESSION_ID),
    };
    match state.registry.get(session_id) {
        Some(session) if session.is_active() => {
            state.registry.touch(session_id);
            Json(Ack::default()).into_response()
        }
        _ => error(StatusCode::NOT_FOUND, error_code::SESSION_NOT_FOUND),
    }
}

async fn close_session(State(state): State<AppState>, body: Bytes) -> Response {
    let request = SessionRequest::from_body(&body);
    let session_id = match request.session_id() {
        Some(id) => id,
        None => return error(StatusCode::BAD_REQUEST, error_code::MISSING_SESSION_ID),
    };
    if state.registry.get(session_id).is_none() {
        return error(StatusCode::NOT_FOUND, error_code::SESSION_NOT_FOUND);
    }
    state.registry.terminate(session_id).await;
    Json(Ack::default()).into_response()
}

async fn terminal(
    State(state): State<AppState>,
    Query(params): Query<TerminalParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (tx, rx) = socket.split();
        state.bridge.serve(&params, tx, rx).await;
    })
}
