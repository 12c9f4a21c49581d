//! Redirect service builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::request;
use axum::response::{IntoResponse, Redirect, Response};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{RedirectError, RedirectResult};
use crate::route::{self, Route};
use crate::upstream::UpstreamClient;
use crate::{proxy, token};

/// State shared by every request handler.
#[derive(Debug, Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) client: UpstreamClient,
}

/// Builder for the redirecting registry service
#[derive(Debug)]
pub struct RedirectBuilder {
    config: Config,
    client: Option<UpstreamClient>,
}

impl RedirectBuilder {
    /// Create a builder for a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Set the upstream client
    ///
    /// Defaults to a TLS client with the default timeout and retry policy.
    pub fn upstream(mut self, client: UpstreamClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the redirect service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let state = AppState {
            config: Arc::new(self.config),
            client: self.client.unwrap_or_default(),
        };

        Router::new()
            .fallback(dispatch)
            .layer(
                TraceLayer::new_for_http().make_span_with(|req: &Request| {
                    tracing::info_span!(
                        "request",
                        method = %req.method(),
                        path = %req.uri().path(),
                    )
                }),
            )
            .with_state(state)
    }
}

/// Route a request by method and path.
///
/// Every request lands here so that method rejection happens before any path
/// matching.
async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let (parts, _) = req.into_parts();

    let result = match route::resolve(&parts.method, parts.uri.path()) {
        Ok(Route::Ping) => proxy::ping(&state, &parts).await,
        Ok(Route::Token) => token::relay(&state, &parts).await,
        Ok(Route::Proxy(target)) => proxy::proxy(&state, &parts, target).await,
        Ok(Route::NotFound) => not_found(&state.config, &parts),
        Err(err) => Err(err),
    };

    result.unwrap_or_else(|err| {
        tracing::debug!("request failed: {err}");
        err.into_response()
    })
}

/// Unknown paths go to the documentation site when one is configured.
fn not_found(config: &Config, parts: &request::Parts) -> RedirectResult<Response> {
    let path = parts.uri.path();
    let Some(docs) = config.docs() else {
        return Err(RedirectError::NotFound(path.to_owned()));
    };

    // The request path only ever extends the docs path, never the origin.
    let mut target = docs.clone();
    target.set_path(&format!("{}{}", docs.path(), path.trim_start_matches('/')));
    Ok(Redirect::temporary(target.as_str()).into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use tower::ServiceExt as _;

    use super::*;
    use crate::config::Upstream;
    use crate::upstream::RetryPolicy;
    use crate::upstream::mock::MockUpstream;

    fn app(config: Config) -> Router {
        RedirectBuilder::new(config)
            .upstream(UpstreamClient::with_service(
                MockUpstream::new(),
                RetryPolicy::none(),
            ))
            .build()
    }

    #[tokio::test]
    async fn unknown_path_is_name_unknown() {
        let response = app(Config::new(Upstream::Ghcr))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["code"], "NAME_UNKNOWN");
    }

    #[tokio::test]
    async fn unknown_path_redirects_to_docs() {
        let config = Config::new(Upstream::Ghcr)
            .with_docs("https://docs.example.dev/images".parse().unwrap())
            .unwrap();

        let response = app(config)
            .oneshot(
                Request::builder()
                    .uri("/static/overview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://docs.example.dev/images/static/overview"
        );
    }

    #[tokio::test]
    async fn docs_redirect_stays_on_docs_site() {
        let config = Config::new(Upstream::Ghcr)
            .with_docs("https://docs.example.dev/images".parse().unwrap())
            .unwrap();
        let app = app(config);

        for path in ["/https://evil.example/phish", "/http:evil.example"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT, "{path}");
            let location: url::Url = response
                .headers()
                .get(header::LOCATION)
                .unwrap()
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(location.host_str(), Some("docs.example.dev"), "{path}");
            assert!(location.path().starts_with("/images/"), "{path}");
        }
    }
}
