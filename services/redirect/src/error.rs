//! Error types for the redirecting registry

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::BodyExt as _;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for redirect operations
pub type RedirectResult<T> = Result<T, RedirectError>;

/// Errors which end a single proxied request.
#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    /// Only `GET` and `HEAD` are ever forwarded.
    #[error("registry is read-only: {0} is not supported")]
    ReadOnly(Method),

    /// The request omitted the visible prefix this host requires.
    #[error("repository {repository} is not under {prefix}/")]
    MissingPrefix {
        /// Required visible prefix
        prefix: String,
        /// Repository the client asked for
        repository: String,
    },

    /// No registry route matched the request path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The upstream registry could not be reached.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyperdriver::client::Error),

    /// The upstream registry answered with a non-success status.
    #[error("{0}")]
    UpstreamStatus(UpstreamStatus),

    /// The upstream response body could not be read.
    #[error("reading upstream body: {0}")]
    Body(#[source] BoxError),

    /// An upstream JSON body could not be decoded or re-encoded.
    #[error("upstream JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The token relay query string was malformed.
    #[error("invalid query: {0}")]
    Query(#[from] serde_urlencoded::de::Error),

    /// The rewritten upstream URI was invalid.
    #[error("invalid upstream URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The upstream request could not be assembled.
    #[error("building upstream request: {0}")]
    Http(#[from] http::Error),
}

impl RedirectError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RedirectError::ReadOnly(_) | RedirectError::Query(_) => StatusCode::BAD_REQUEST,
            RedirectError::MissingPrefix { .. } | RedirectError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RedirectError::UpstreamStatus(upstream) => upstream.status,
            RedirectError::Upstream(_)
            | RedirectError::Body(_)
            | RedirectError::Json(_)
            | RedirectError::InvalidUri(_)
            | RedirectError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RedirectError::ReadOnly(_) | RedirectError::Query(_) => "UNSUPPORTED",
            RedirectError::MissingPrefix { .. } => "MANIFEST_UNKNOWN",
            RedirectError::NotFound(_) => "NAME_UNKNOWN",
            RedirectError::UpstreamStatus(_)
            | RedirectError::Upstream(_)
            | RedirectError::Body(_)
            | RedirectError::Json(_)
            | RedirectError::InvalidUri(_)
            | RedirectError::Http(_) => "UNKNOWN",
        }
    }
}

/// A non-success upstream response, kept so it can be relayed as-is.
#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    /// Status returned by the upstream
    pub status: StatusCode,

    /// Content type of the upstream body, if any
    pub content_type: Option<HeaderValue>,

    /// Upstream body
    pub body: Bytes,
}

impl UpstreamStatus {
    /// Capture an upstream response, reading its body to completion.
    pub async fn from_response(
        response: http::Response<hyperdriver::Body>,
    ) -> RedirectResult<Self> {
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| RedirectError::Body(err.into()))?
            .to_bytes();

        Ok(Self {
            status: parts.status,
            content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
            body,
        })
    }
}

impl std::fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream responded with {}", self.status)
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RedirectError {
    fn into_response(self) -> Response {
        if let RedirectError::UpstreamStatus(upstream) = self {
            let mut headers = HeaderMap::new();
            if let Some(content_type) = upstream.content_type {
                headers.insert(header::CONTENT_TYPE, content_type);
            }
            return (upstream.status, headers, upstream.body).into_response();
        }

        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}
