//! Bearer token injection for outgoing gateway requests.

use reqwest::header::{AUTHORIZATION, HeaderValue};

use crate::error::GatewayError;

/// Build the `Authorization` header value for `token`.
///
/// A missing or blank token yields `Ok(None)`: the request goes out
/// anonymously and the backend decides whether that is acceptable.
///
/// # Errors
///
/// Returns [`GatewayError::Transport`] if the token contains characters
/// that are not valid in a header value.
pub(crate) fn bearer_value(token: Option<&str>) -> Result<Option<HeaderValue>, GatewayError> {
    let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
        return Ok(None);
    };
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| GatewayError::Transport("invalid token characters".into()))?;
    value.set_sensitive(true);
    Ok(Some(value))
}

/// Attach the bearer header for `token` to `builder`, if there is one.
pub(crate) fn with_bearer(
    builder: reqwest::RequestBuilder,
    token: Option<&str>,
) -> Result<reqwest::RequestBuilder, GatewayError> {
    Ok(match bearer_value(token)? {
        Some(value) => builder.header(AUTHORIZATION, value),
        None => builder,
    })
}
