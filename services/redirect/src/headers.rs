//! Header selection between client and upstream.

use std::fmt;

use axum::http::{HeaderMap, HeaderName, header, request};

/// Header naming the upstream URL a response came from.
pub const X_REDIRECTED: HeaderName = HeaderName::from_static("x-redirected");

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// End-to-end client headers to send upstream.
///
/// `Host` and `Content-Length` describe the client's connection to this
/// service, so they are dropped along with hop-by-hop headers.
pub fn forwarded(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Upstream headers to relay to the client, keeping every value of multi-value headers.
pub fn relayed(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// The host a request was addressed to.
pub fn request_host(parts: &request::Parts) -> Option<&str> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
        .filter(|host| !host.is_empty())
}

/// Debug view of a header map which hides credentials.
pub struct Redacted<'h>(pub &'h HeaderMap);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.0 {
            if name == header::AUTHORIZATION || name == header::COOKIE || value.is_sensitive() {
                map.entry(&name.as_str(), &"****");
            } else {
                map.entry(&name.as_str(), value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, Request};

    use super::*;

    #[test]
    fn forwarded_drops_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("cgr.dev"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        headers.append(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.append(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.oci.image.index.v1+json"),
        );

        let out = forwarded(&headers);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(out.get_all(header::ACCEPT).iter().count(), 2);
    }

    #[test]
    fn relayed_keeps_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let out = relayed(&headers);
        assert_eq!(out.get(header::CONTENT_LENGTH).unwrap(), "12");
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn host_from_header_or_uri() {
        let (parts, _) = Request::builder()
            .uri("/v2/")
            .header(header::HOST, "cgr.dev")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_host(&parts), Some("cgr.dev"));

        let (parts, _) = Request::builder()
            .uri("http://distroless.dev/v2/")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_host(&parts), Some("distroless.dev"));

        let (parts, _) = Request::builder().uri("/v2/").body(()).unwrap().into_parts();
        assert_eq!(request_host(&parts), None);
    }

    #[test]
    fn redacted_hides_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer hunter2"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let text = format!("{:?}", Redacted(&headers));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("*/*"));
    }
}
