//! Crate-wide error classification.
//!
//! Mirrors the teacher's `ErrorKind` / `ReportableError` / `UserFacingError`
//! split: every error that can reach an HTTP boundary is classified for
//! metrics (`ReportableError`) and, where safe, rendered to a client
//! (`UserFacingError`) without leaking internal detail.

use std::fmt;

use hyper::{Body, Response, StatusCode};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// No backend matches the inbound request.
    NoMatch,
    /// Backend is missing `host` or `path`.
    Misconfigured,
    /// Backend is present but `active == false`.
    Inactive,
    /// Upstream (the backend workload) failed to respond.
    Upstream,
    /// The workload driver (runtime or virtualization) failed or timed out.
    Driver,
    /// Configuration document failed to parse.
    Config,
}

impl ErrorKind {
    pub fn to_metric_label(&self) -> &'static str {
        match self {
            ErrorKind::NoMatch => "no_match",
            ErrorKind::Misconfigured => "misconfigured",
            ErrorKind::Inactive => "inactive",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Driver => "driver",
            ErrorKind::Config => "config",
        }
    }
}

pub trait ReportableError: fmt::Display + Send + Sync + 'static {
    fn get_error_kind(&self) -> ErrorKind;
}

/// Marks errors that may be safely shown to a client.
///
/// NOTE: do not implement for `anyhow::Error` — it's too convenient and
/// tends to proliferate, eventually leaking internal detail to clients.
pub trait UserFacingError: ReportableError {
    #[inline(always)]
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no backend matches this request")]
    NoMatch,
    #[error("backend {0} is missing host or path")]
    Misconfigured(String),
    #[error("backend {0} is inactive")]
    Inactive(String),
    #[error("upstream error: {0}")]
    Upstream(#[source] anyhow::Error),
}

impl ReportableError for DispatchError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            DispatchError::NoMatch => ErrorKind::NoMatch,
            DispatchError::Misconfigured(_) => ErrorKind::Misconfigured,
            DispatchError::Inactive(_) => ErrorKind::Inactive,
            DispatchError::Upstream(_) => ErrorKind::Upstream,
        }
    }
}

impl UserFacingError for DispatchError {
    fn to_string_client(&self) -> String {
        match self {
            DispatchError::NoMatch => "not found".to_string(),
            DispatchError::Misconfigured(_) => "backend misconfigured".to_string(),
            DispatchError::Inactive(_) => "backend is inactive".to_string(),
            DispatchError::Upstream(_) => "upstream error".to_string(),
        }
    }
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NoMatch => StatusCode::NOT_FOUND,
            DispatchError::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Inactive(_) => StatusCode::FORBIDDEN,
            DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Error type for the admin HTTP surface, turned into a JSON body + status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("{}")))
    }
}

pub fn json_response(
    status: StatusCode,
    value: serde_json::Value,
) -> Result<Response<Body>, anyhow::Error> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))?)
}
