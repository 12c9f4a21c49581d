//! Copying upstream bodies to the client.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};

use crate::config::BlobBodies;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Upstream body being copied to the client.
///
/// Headers are already committed by the time a frame fails, so errors are
/// logged here and otherwise only end the response.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct CopyBody<B> {
    #[pin]
    inner: B,
    url: String,
}

impl<B> CopyBody<B> {
    /// Wrap the body of a response fetched from `url`.
    pub fn new(inner: B, url: impl Into<String>) -> Self {
        Self {
            inner,
            url: url.into(),
        }
    }
}

impl<B> Body for CopyBody<B>
where
    B: Body,
    B::Error: fmt::Display,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Err(err)) => {
                tracing::error!(url = %this.url, "error copying response body: {err}");
                Poll::Ready(Some(Err(err)))
            }
            frame => Poll::Ready(frame),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Stream an upstream body to the client.
pub fn stream<B>(body: B, url: &str) -> axum::body::Body
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + fmt::Display,
{
    axum::body::Body::new(CopyBody::new(body, url))
}

/// Body for a blob response.
///
/// Redirect bodies are always dropped; other bodies follow `policy`. When a
/// body is dropped from a `GET` the upstream `Content-Length` no longer
/// applies and is removed from `headers`.
pub fn blob<B>(
    status: StatusCode,
    method: &Method,
    policy: BlobBodies,
    headers: &mut HeaderMap,
    body: B,
    url: &str,
) -> axum::body::Body
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + fmt::Display,
{
    if !status.is_redirection() && policy == BlobBodies::Proxy {
        return stream(body, url);
    }

    tracing::debug!(%status, ?policy, "dropping blob body");
    if method != Method::HEAD {
        headers.remove(header::CONTENT_LENGTH);
    }
    axum::body::Body::empty()
}
