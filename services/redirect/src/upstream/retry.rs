//! Transparent retries for idempotent upstream requests.

use std::time::Duration;

use http::{Method, StatusCode};
use hyperdriver::Body;
use tower::retry::Policy;

/// Retry `GET` and `HEAD` requests on transport errors and gateway failures,
/// waiting with exponential backoff between attempts.
///
/// Tower clones the policy for every request, so the remaining attempts are
/// tracked per request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: usize,
    delay: Duration,
    exponent: u32,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `attempts` times after the first try.
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts,
            ..Default::default()
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Set the first delay and the cap on later delays.
    pub fn with_backoff(mut self, delay: Duration, max_delay: Duration) -> Self {
        self.delay = delay;
        self.max_delay = max_delay;
        self
    }

    /// Attempts left after the first try.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    fn should_retry<E>(
        &self,
        req: &http::Request<Body>,
        result: &Result<http::Response<Body>, E>,
    ) -> bool
    where
        E: std::fmt::Display,
    {
        if self.attempts == 0 || !matches!(*req.method(), Method::GET | Method::HEAD) {
            return false;
        }

        match result {
            Ok(res) => matches!(
                res.status(),
                StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            Err(err) => {
                tracing::warn!("retrying request to {} due to error: {err}", req.uri());
                true
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(100),
            exponent: 2,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl<E> Policy<http::Request<Body>, http::Response<Body>, E> for RetryPolicy
where
    E: std::fmt::Display,
{
    type Future = BackoffFuture;

    fn retry(
        &mut self,
        req: &mut http::Request<Body>,
        result: &mut Result<http::Response<Body>, E>,
    ) -> Option<Self::Future> {
        if !self.should_retry(req, result) {
            return None;
        }

        if let Ok(res) = result {
            tracing::debug!("retrying request to {} after {}", req.uri(), res.status());
        }

        let delay = self.delay;
        self.attempts -= 1;
        self.delay = self
            .delay
            .checked_mul(self.exponent)
            .map_or(self.max_delay, |next| next.min(self.max_delay));

        Some(BackoffFuture::new(delay))
    }

    fn clone_request(&mut self, req: &http::Request<Body>) -> Option<http::Request<Body>> {
        let body = req.body().try_clone()?;

        let mut next = http::Request::new(body);
        *next.method_mut() = req.method().clone();
        *next.uri_mut() = req.uri().clone();
        *next.version_mut() = req.version();
        *next.headers_mut() = req.headers().clone();
        *next.extensions_mut() = req.extensions().clone();

        Some(next)
    }
}

/// Sleep before the next attempt.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct BackoffFuture {
    #[pin]
    sleep: tokio::time::Sleep,
}

impl BackoffFuture {
    fn new(delay: Duration) -> Self {
        Self {
            sleep: tokio::time::sleep(delay),
        }
    }
}

impl std::future::Future for BackoffFuture {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.project().sleep.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method) -> http::Request<Body> {
        http::Request::builder()
            .method(method)
            .uri("https://ghcr.io/v2/")
            .body(Body::empty())
            .unwrap()
    }

    fn response(status: StatusCode) -> Result<http::Response<Body>, hyperdriver::client::Error> {
        Ok(http::Response::builder()
            .status(status)
            .body(Body::empty())
            .unwrap())
    }

    #[tokio::test]
    async fn retries_gateway_errors_until_exhausted() {
        let mut policy = RetryPolicy::new(2).with_backoff(Duration::ZERO, Duration::ZERO);
        let mut req = request(Method::GET);

        for (status, retried) in [
            (StatusCode::SERVICE_UNAVAILABLE, true),
            (StatusCode::BAD_GATEWAY, true),
            (StatusCode::GATEWAY_TIMEOUT, false),
        ] {
            let decision = policy.retry(&mut req, &mut response(status));
            assert_eq!(decision.is_some(), retried, "{status}");
        }
        assert_eq!(policy.attempts(), 0);
    }

    #[tokio::test]
    async fn retries_transport_errors() {
        let mut policy = RetryPolicy::new(1);
        let mut req = request(Method::HEAD);
        let mut result: Result<http::Response<Body>, hyperdriver::client::Error> =
            Err(hyperdriver::client::Error::RequestTimeout);

        assert!(policy.retry(&mut req, &mut result).is_some());
    }

    #[tokio::test]
    async fn final_answers_are_not_retried() {
        let mut policy = RetryPolicy::default();
        let mut req = request(Method::GET);

        for status in [
            StatusCode::OK,
            StatusCode::TEMPORARY_REDIRECT,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            let decision = policy.retry(&mut req, &mut response(status));
            assert!(decision.is_none(), "{status}");
        }
    }

    #[tokio::test]
    async fn only_idempotent_requests_are_retried() {
        let mut policy = RetryPolicy::default();
        let mut req = request(Method::POST);
        let decision = policy.retry(&mut req, &mut response(StatusCode::BAD_GATEWAY));
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn backoff_is_capped() {
        let mut policy = RetryPolicy::new(3)
            .with_backoff(Duration::from_millis(400), Duration::from_secs(1));
        let mut req = request(Method::GET);

        for expected in [800, 1000, 1000] {
            let decision = policy.retry(&mut req, &mut response(StatusCode::BAD_GATEWAY));
            assert!(decision.is_some());
            assert_eq!(policy.delay, Duration::from_millis(expected));
        }
    }
}
