//! JSON bodies of the HTTP session API

/// Response to `POST /terminal/session`
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
    /// Relative URL of the terminal connection, including the secret
    pub ws_url: String,
    pub expires_in_seconds: u64,
}

/// Request body of `POST /terminal/heartbeat` and `POST /terminal/close`
///
/// The id is optional here so a missing field can be reported as a
/// validation error instead of a decoding failure.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SessionRequest {
    /// Decode a request body, treating anything unparseable as empty
    pub fn from_body(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    /// The session id, if present and non-empty
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Query parameters of the terminal connection
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Generic success body, `{"ok":true}`
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Default for Ack {
    fn default() -> Self {
        Ack { ok: true }
    }
}

/// Error body, `{"error":"<code>"}`
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new<S: Into<String>>(code: S) -> Self {
        ErrorBody { error: code.into() }
    }
}

/// Error codes used in [ErrorBody]
pub mod error_code {
    pub const MAX_CONCURRENT_SESSIONS: &str = "max_concurrent_sessions_reached";
    pub const MAX_SESSIONS_PER_IP: &str = "max_sessions_per_ip_reached";
    pub const SESSION_CREATION_FAILED: &str = "session_creation_failed";
    pub const MISSING_SESSION_ID: &str = "missing_session_id";
    pub const SESSION_NOT_FOUND: &str = "session_not_found";
    pub const SHUTTING_DOWN: &str = "server_shutting_down";
}
