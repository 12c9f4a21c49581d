//! In-memory upstream registry for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
enum MockResponse {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Fail,
}

/// A request seen by the [`MockUpstream`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method
    pub method: Method,

    /// Full request URI
    pub uri: Uri,

    /// Request headers
    pub headers: HeaderMap,
}

/// An upstream registry answering from canned responses.
///
/// Responses are keyed by path and query (`/v2/a/tags/list?n=1`), falling back
/// to the bare path. Several responses for one key are served in order, and the
/// last one repeats. Unknown keys get a `404`.
#[derive(Debug, Default, Clone)]
pub struct MockUpstream {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    /// Create an upstream with no responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `key` with a response.
    pub fn add(&self, key: &str, status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) {
        self.push(
            key,
            MockResponse::Respond {
                status,
                headers,
                body: body.into(),
            },
        );
    }

    /// Answer `key` with a JSON body.
    pub fn add_json(&self, key: &str, status: StatusCode, body: &serde_json::Value) {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.add(key, status, headers, body.to_string());
    }

    /// Answer `key` with a transport error.
    pub fn fail(&self, key: &str) {
        self.push(key, MockResponse::Fail);
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Requests seen for a path.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|req| req.uri.path() == path)
            .cloned()
            .collect()
    }

    fn push(&self, key: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push_back(response);
    }

    fn next(&self, uri: &Uri) -> Option<MockResponse> {
        let mut responses = self.responses.lock();
        let key = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|key| responses.contains_key(*key))
            .unwrap_or(uri.path())
            .to_owned();

        let queue = responses.get_mut(&key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl tower::Service<hyperdriver::body::Request> for MockUpstream {
    type Response = hyperdriver::body::Response;
    type Error = hyperdriver::client::Error;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: hyperdriver::body::Request) -> Self::Future {
        self.requests.lock().push(RecordedRequest {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        });

        let (status, headers, body) = match self.next(req.uri()) {
            Some(MockResponse::Respond {
                status,
                headers,
                body,
            }) => (status, headers, body),
            Some(MockResponse::Fail) => {
                return std::future::ready(Err(hyperdriver::client::Error::RequestTimeout));
            }
            None => (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()),
        };

        let mut response = http::Response::new(hyperdriver::Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        std::future::ready(Ok(response))
    }
}
