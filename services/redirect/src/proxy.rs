//! Forwarding registry requests to the upstream.

use axum::http::{HeaderMap, HeaderValue, Method, header, request};
use axum::response::{IntoResponse as _, Response};
use http_body_util::BodyExt as _;

use crate::api::AppState;
use crate::error::{RedirectError, RedirectResult};
use crate::headers::{self, Redacted, X_REDIRECTED};
use crate::path::Mapping;
use crate::rewrite;
use crate::route::Target;
use crate::{body, token};

/// Relay an upstream response to the client without rewriting it.
pub(crate) fn relay_response(response: hyperdriver::body::Response, url: &str) -> Response {
    let (parts, upstream_body) = response.into_parts();
    let mut headers = headers::relayed(&parts.headers);
    mark_redirected(&mut headers, url);

    let mut response = Response::new(body::stream(upstream_body, url));
    *response.status_mut() = parts.status;
    *response.headers_mut() = headers;
    response
}

fn mark_redirected(headers: &mut HeaderMap, url: &str) {
    if let Ok(value) = HeaderValue::try_from(url) {
        headers.insert(X_REDIRECTED, value);
    }
}

/// Error response for a request which already went to `url`.
pub(crate) fn failed(err: RedirectError, url: &str) -> Response {
    tracing::debug!(%url, "request failed: {err}");
    let mut response = err.into_response();
    mark_redirected(response.headers_mut(), url);
    response
}

async fn send(
    state: &AppState,
    method: &Method,
    url: &str,
    headers: HeaderMap,
) -> RedirectResult<hyperdriver::body::Response> {
    let mut req = http::Request::builder()
        .method(method.clone())
        .uri(url.parse::<http::Uri>()?)
        .body(hyperdriver::Body::empty())?;
    *req.headers_mut() = headers;

    tracing::info!(%method, %url, headers = ?Redacted(req.headers()), "sending request");
    let response = state.client.send(req).await.map_err(|err| {
        tracing::error!(%url, "error sending request: {err}");
        RedirectError::from(err)
    })?;
    tracing::info!(
        %method,
        %url,
        status = %response.status(),
        headers = ?Redacted(response.headers()),
        "got response"
    );

    Ok(response)
}

/// `GET /v2/`: check the upstream API version, pointing its token realm here.
pub(crate) async fn ping(state: &AppState, parts: &request::Parts) -> RedirectResult<Response> {
    let host = headers::request_host(parts);
    let mapping = Mapping::new(&state.config, host);
    let url = state.config.upstream().registry_base();

    let forwarded = headers::forwarded(&parts.headers);
    let response = match send(state, &parts.method, &url, forwarded).await {
        Ok(response) => response,
        Err(err) => return Ok(failed(err, &url)),
    };
    let (upstream, upstream_body) = response.into_parts();

    let mut headers = rewrite::response_headers(&upstream.headers, &state.config, &mapping, host);
    mark_redirected(&mut headers, &url);

    let mut response = Response::new(body::stream(upstream_body, &url));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Manifests, blobs and tag listings.
pub(crate) async fn proxy(
    state: &AppState,
    parts: &request::Parts,
    target: Target,
) -> RedirectResult<Response> {
    let host = headers::request_host(parts);
    let mapping = Mapping::new(&state.config, host);
    let url = mapping.upstream_url(&target, parts.uri.query())?;

    let mut forwarded = headers::forwarded(&parts.headers);
    if target.is_tag_list() {
        forwarded.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }

    if !forwarded.contains_key(header::AUTHORIZATION) {
        let repository = mapping.to_upstream(&target.repository)?;
        let authorization = token::exchange(state, &repository, &forwarded).await?;
        forwarded.insert(header::AUTHORIZATION, authorization);
    }

    let response = match send(state, &parts.method, &url, forwarded).await {
        Ok(response) => response,
        Err(err) => return Ok(failed(err, &url)),
    };
    let (upstream, upstream_body) = response.into_parts();

    let mut headers = rewrite::response_headers(&upstream.headers, &state.config, &mapping, host);
    mark_redirected(&mut headers, &url);

    let body = if target.is_tag_list() && parts.method == Method::HEAD {
        // The rewritten listing has a different length than the upstream's.
        headers.remove(header::CONTENT_LENGTH);
        body::stream(upstream_body, &url)
    } else if target.is_tag_list() && upstream.status.is_success() {
        let bytes = match upstream_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => return Ok(failed(RedirectError::Body(err.into()), &url)),
        };
        let rewritten = match rewrite::tag_list(&bytes, &mapping) {
            Ok(rewritten) => rewritten,
            Err(err) => {
                tracing::error!(%url, "error rewriting tag list: {err}");
                return Ok(failed(err.into(), &url));
            }
        };

        headers.remove(header::CONTENT_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        axum::body::Body::from(rewritten)
    } else if target.is_blob() {
        body::blob(
            upstream.status,
            &parts.method,
            state.config.blob_bodies(),
            &mut headers,
            upstream_body,
            &url,
        )
    } else {
        body::stream(upstream_body, &url)
    };

    let mut response = Response::new(body);
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    Ok(response)
}
