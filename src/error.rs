//! Crate-level error types for gateway calls, session persistence and
//! configuration loading.

/// Error returned when a call through the [`Gateway`](crate::Gateway) fails.
///
/// Variants follow the portal's error taxonomy: no response at all, a
/// rejected credential, a validation failure, a server-side failure, or a
/// body that could not be decoded. Views never show these directly; they
/// render [`GatewayError::user_message`] into their local error state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// No response reached the client (connection refused, DNS, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered `401 Unauthorized`.
    ///
    /// Carries the body's `message` field when the server sent one.
    #[error("unauthorized")]
    Unauthorized {
        /// Server-provided message, if any.
        message: Option<String>,
    },

    /// The backend answered `400 Bad Request`.
    #[error("validation failed: {}", message.as_deref().unwrap_or("no message"))]
    Validation {
        /// Server-provided message, if any.
        message: Option<String>,
    },

    /// The backend answered with a `5xx` status.
    #[error("server error: HTTP {status}")]
    Server {
        /// The HTTP status code.
        status: u16,
    },

    /// Any other non-success status (403, 404, 409, ...).
    #[error("HTTP {status}: {}", message.as_deref().unwrap_or("no message"))]
    Status {
        /// The HTTP status code.
        status: u16,
        /// Server-provided message, if any.
        message: Option<String>,
    },

    /// A response body (or push frame) was not the expected JSON shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Login succeeded at the HTTP level but the body carried no patient id
    /// or token.
    #[error("login rejected: {}", message.as_deref().unwrap_or("no message"))]
    LoginRejected {
        /// Server-provided message, if any.
        message: Option<String>,
    },
}

/// Fallback shown when the server rejects credentials without a message.
pub const INVALID_CREDENTIALS_MESSAGE: &str =
    "Invalid email or password. Please check your credentials and try again.";

/// Fallback shown for a `400` without a server message.
pub const VALIDATION_FALLBACK_MESSAGE: &str =
    "Invalid request. Please check the submitted values and try again.";

/// Shown for any `5xx`.
pub const SERVER_FAILURE_MESSAGE: &str = "Server error. Please try again later.";

/// Fallback shown when a login body carries no identity.
pub const LOGIN_FAILED_MESSAGE: &str = "Login failed. Please try again.";

/// Shown when no response reached the client.
pub const CONNECTIVITY_MESSAGE: &str =
    "Unable to connect to the server. Please check your connection and try again.";

impl GatewayError {
    /// Classify a non-success HTTP status, pulling the `message` field out
    /// of the JSON body when there is one.
    ///
    /// # Arguments
    ///
    /// * `status` - The HTTP status code (must not be 2xx).
    /// * `body` - The parsed response body, if it was JSON.
    ///
    /// # Returns
    ///
    /// The matching [`GatewayError`] variant.
    pub fn from_status(status: u16, body: Option<&serde_json::Value>) -> Self {
        let message = body
            .and_then(|b| b.get("message"))
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .map(str::to_owned);

        match status {
            401 => Self::Unauthorized { message },
            400 => Self::Validation { message },
            500..=599 => Self::Server { status },
            _ => Self::Status { status, message },
        }
    }

    /// Returns `true` for failures the notification channel should simply
    /// retry on its next tick or reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }

    /// Human-readable text for a view's error slot.
    ///
    /// # Returns
    ///
    /// The server-provided message when the taxonomy allows it, otherwise
    /// a generic message for the failure class.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) => CONNECTIVITY_MESSAGE.to_owned(),
            Self::Unauthorized { message } => message
                .clone()
                .unwrap_or_else(|| INVALID_CREDENTIALS_MESSAGE.to_owned()),
            Self::Validation { message } => message
                .clone()
                .unwrap_or_else(|| VALIDATION_FALLBACK_MESSAGE.to_owned()),
            Self::Server { .. } => SERVER_FAILURE_MESSAGE.to_owned(),
            Self::Status { status, message } => message
                .clone()
                .unwrap_or_else(|| format!("Request failed: HTTP {status}")),
            Self::Decode(_) => "Received an unexpected response from the server.".to_owned(),
            Self::LoginRejected { message } => message
                .clone()
                .unwrap_or_else(|| LOGIN_FAILED_MESSAGE.to_owned()),
        }
    }
}

/// Error returned by [`SessionStore::login`](crate::SessionStore::login)
/// and [`SessionStore::logout`](crate::SessionStore::logout).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The identity carried no auth token, so it can never authenticate.
    #[error("identity has no auth token")]
    MissingToken,

    /// The identity carried an empty subject id.
    #[error("identity has no subject id")]
    MissingSubject,

    /// The session blob could not be encoded.
    #[error("session encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The session storage backend failed.
    #[error("session storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Error returned by [`Portal::login`](crate::Portal::login).
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    /// The backend refused or could not be reached.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The backend accepted the credentials but the session could not be
    /// stored.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl LoginError {
    /// Text for the login form's error slot.
    pub fn user_message(&self) -> String {
        match self {
            Self::Gateway(e) => e.user_message(),
            Self::Session(_) => LOGIN_FAILED_MESSAGE.to_owned(),
        }
    }
}

/// Error returned when loading [`PortalConfig`](crate::PortalConfig) from
/// the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set but did not parse.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// The environment variable name.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
