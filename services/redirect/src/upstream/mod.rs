//! The outbound HTTP client shared by every handler.

use std::time::Duration;

use hyperdriver::service::SharedService;
use tower::ServiceExt as _;

pub mod mock;
mod retry;

pub use self::retry::RetryPolicy;

/// Time allowed to establish a connection to the upstream.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a whole upstream request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for the upstream registry.
///
/// Redirects are returned to the caller rather than followed, so blob
/// redirects reach the client unchanged.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    inner: hyperdriver::client::SharedClientService<hyperdriver::Body>,
}

impl UpstreamClient {
    /// Create a TLS client with a request timeout and a retry policy.
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Self {
        let mut builder = hyperdriver::Client::build_tcp_http();
        builder.transport().config_mut().connect_timeout = Some(CONNECT_TIMEOUT);

        let client = builder
            .with_default_tls()
            .with_timeout(timeout)
            .build_service();
        Self::with_service(client, policy)
    }

    /// Wrap another service, e.g. a mock upstream.
    pub fn with_service<S>(inner: S, policy: RetryPolicy) -> Self
    where
        S: tower::Service<
                hyperdriver::body::Request,
                Response = hyperdriver::body::Response,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let inner = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(tower::retry::RetryLayer::new(policy))
            .service(inner);

        Self { inner }
    }

    /// Send a request upstream.
    pub async fn send(
        &self,
        req: hyperdriver::body::Request,
    ) -> Result<hyperdriver::body::Response, hyperdriver::client::Error> {
        self.inner.clone().oneshot(req).await
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, StatusCode};

    use super::mock::MockUpstream;
    use super::*;

    fn get(uri: &str) -> hyperdriver::body::Request {
        http::Request::builder()
            .uri(uri)
            .body(hyperdriver::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn retries_through_the_client() {
        let mock = MockUpstream::new();
        mock.add("/v2/", StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), "");
        mock.add("/v2/", StatusCode::OK, HeaderMap::new(), "{}");

        let policy = RetryPolicy::new(2).with_backoff(Duration::ZERO, Duration::ZERO);
        let client = UpstreamClient::with_service(mock.clone(), policy);

        let response = client.send(get("https://ghcr.io/v2/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(mock.requests_to("/v2/").len(), 2);
    }

    #[tokio::test]
    async fn no_retry_policy_sends_once() {
        let mock = MockUpstream::new();
        mock.fail("/v2/");

        let client = UpstreamClient::with_service(mock.clone(), RetryPolicy::none());
        assert!(client.send(get("https://ghcr.io/v2/")).await.is_err());
        assert_eq!(mock.requests().len(), 1);
    }
}
