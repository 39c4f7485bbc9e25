//! Shared HTTP plumbing: client construction and failure classification.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use trajgen_core::{ModelError, ToolError};

const USER_AGENT: &str = concat!("trajgen/", env!("CARGO_PKG_VERSION"));

/// Longest error body echoed back in an error message.
const ERROR_BODY_CHARS: usize = 200;

pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// 408, 429 and every 5xx are worth retrying; other statuses are not.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub fn is_transient_transport(err: &reqwest::Error) -> bool {
    !err.is_builder() && !err.is_redirect()
}

/// Failure of one HTTP exchange, before it is mapped to a tool or model error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    pub transient: bool,
    pub message: String,
}

impl HttpFailure {
    pub fn transport(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            format!("failed to connect: {err}")
        } else {
            format!("HTTP request failed: {err}")
        };
        Self {
            transient: is_transient_transport(err),
            message,
        }
    }

    pub fn status(status: StatusCode, body: &str) -> Self {
        let mut message = format!(
            "HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
        let body = body.trim();
        if !body.is_empty() {
            message.push_str(": ");
            message.extend(body.chars().take(ERROR_BODY_CHARS));
        }
        Self {
            transient: is_transient_status(status),
            message,
        }
    }

    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self {
            transient: true,
            message: format!("malformed response: {reason}"),
        }
    }
}

impl From<HttpFailure> for ToolError {
    fn from(failure: HttpFailure) -> Self {
        if failure.transient {
            ToolError::Transient(failure.message)
        } else {
            ToolError::Permanent(failure.message)
        }
    }
}

impl From<HttpFailure> for ModelError {
    fn from(failure: HttpFailure) -> Self {
        if failure.transient {
            ModelError::Transient(failure.message)
        } else {
            ModelError::Permanent(failure.message)
        }
    }
}

/// Return the body of a successful response, or the classified failure.
pub async fn read_success(response: Response) -> Result<String, HttpFailure> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| HttpFailure::transport(&err))?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(HttpFailure::status(status, &body))
    }
}
