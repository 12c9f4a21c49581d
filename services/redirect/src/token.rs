//! Bearer tokens from the upstream registry.
//!
//! Requests which arrive without credentials get an anonymous pull token on
//! the client's behalf. Clients which follow the rewritten realm reach
//! [`relay`], which forwards the token request after mapping its scopes.

use std::fmt;
use std::str::FromStr;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, request};
use axum::response::Response;
use serde::Deserialize;
use zeroize::Zeroize;

use crate::api::AppState;
use crate::error::{RedirectError, RedirectResult, UpstreamStatus};
use crate::headers::{self, Redacted};
use crate::path::Mapping;

/// A bearer token issued by the upstream registry.
///
/// The value never appears in debug output and is wiped when dropped.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Token(String);

impl Token {
    /// Expose the token value.
    pub fn revealed(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value carrying this token, marked sensitive.
    pub fn bearer(&self) -> Result<HeaderValue, http::header::InvalidHeaderValue> {
        let mut value = HeaderValue::try_from(format!("Bearer {}", self.0))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Token(value)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(****)")
    }
}

/// Token endpoint response. Registries use either `token` or `access_token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<Token>,

    #[serde(default)]
    access_token: Option<Token>,
}

impl TokenResponse {
    fn into_token(self) -> Result<Token, serde_json::Error> {
        self.token
            .or(self.access_token)
            .ok_or_else(|| <serde_json::Error as serde::de::Error>::missing_field("token"))
    }
}

#[derive(Debug, serde::Serialize)]
struct TokenQuery<'a> {
    scope: String,
    service: &'a str,
}

/// Fetch a pull token for an upstream repository.
///
/// A non-200 answer from the token endpoint is returned as
/// [`RedirectError::UpstreamStatus`] so it can be relayed verbatim.
pub(crate) async fn exchange(
    state: &AppState,
    repository: &str,
    client_headers: &HeaderMap,
) -> RedirectResult<HeaderValue> {
    let upstream = state.config.upstream();
    let query = serde_urlencoded::to_string(TokenQuery {
        scope: format!("repository:{repository}:pull"),
        service: upstream.service(),
    })
    .map_err(|err| RedirectError::Body(err.into()))?;
    let url = format!("{}?{}", upstream.token_endpoint(), query);

    let mut req = http::Request::builder()
        .method(Method::GET)
        .uri(url.parse::<http::Uri>()?)
        .body(hyperdriver::Body::empty())?;
    *req.headers_mut() = client_headers.clone();

    tracing::debug!(%url, "requesting token");
    let response = state.client.send(req).await.map_err(|err| {
        tracing::error!(%url, "error getting token: {err}");
        RedirectError::from(err)
    })?;

    if response.status() != StatusCode::OK {
        tracing::info!(status = %response.status(), "error response getting token");
        return Err(RedirectError::UpstreamStatus(
            UpstreamStatus::from_response(response).await?,
        ));
    }

    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .map_err(|err| RedirectError::Body(err.into()))?
        .to_bytes();
    let token = serde_json::from_slice::<TokenResponse>(&body)?.into_token()?;

    token.bearer().map_err(|err| RedirectError::Body(err.into()))
}

/// A token scope of the form `type:name:actions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Resource type, usually `repository`.
    pub kind: String,

    /// Resource name, may contain `/` and `:`.
    pub name: String,

    /// Comma separated actions, e.g. `pull`.
    pub actions: String,
}

impl FromStr for Scope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s.split_once(':').ok_or(())?;
        let (name, actions) = rest.rsplit_once(':').ok_or(())?;
        if kind.is_empty() || name.is_empty() {
            return Err(());
        }

        Ok(Scope {
            kind: kind.to_owned(),
            name: name.to_owned(),
            actions: actions.to_owned(),
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.name, self.actions)
    }
}

/// Map every repository scope in a `scope` value into the upstream's names.
///
/// Scopes are space separated. Anything which is not a repository scope is
/// passed through.
pub fn map_scopes(value: &str, mapping: &Mapping<'_>) -> String {
    value
        .split_whitespace()
        .map(|scope| match scope.parse::<Scope>() {
            Ok(mut scope) if scope.kind == "repository" => {
                scope.name = mapping.scope_to_upstream(&scope.name);
                scope.to_string()
            }
            _ => scope.to_owned(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Relay a client's token request to the upstream token endpoint.
pub(crate) async fn relay(state: &AppState, parts: &request::Parts) -> RedirectResult<Response> {
    let mapping = Mapping::new(&state.config, headers::request_host(parts));
    let upstream = state.config.upstream();

    let params: Vec<(String, String)> =
        serde_urlencoded::from_str(parts.uri.query().unwrap_or_default())?;
    let params: Vec<(String, String)> = params
        .into_iter()
        .map(|(key, value)| {
            if key == "scope" {
                let mapped = map_scopes(&value, &mapping);
                tracing::debug!(before = %value, after = %mapped, "rewrote scope");
                (key, mapped)
            } else {
                (key, value)
            }
        })
        .collect();

    let mut url = upstream.token_endpoint();
    if !params.is_empty() {
        let query =
            serde_urlencoded::to_string(&params).map_err(|err| RedirectError::Body(err.into()))?;
        url.push('?');
        url.push_str(&query);
    }

    let forwarded = headers::forwarded(&parts.headers);
    let mut req = http::Request::builder()
        .method(parts.method.clone())
        .uri(url.parse::<http::Uri>()?)
        .body(hyperdriver::Body::empty())?;
    *req.headers_mut() = forwarded;

    tracing::info!(
        method = %parts.method,
        %url,
        headers = ?Redacted(req.headers()),
        "sending request"
    );
    let response = match state.client.send(req).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%url, "error sending request: {err}");
            return Ok(crate::proxy::failed(err.into(), &url));
        }
    };
    tracing::info!(
        status = %response.status(),
        headers = ?Redacted(response.headers()),
        "got response"
    );

    Ok(crate::proxy::relay_response(response, &url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Upstream};

    #[test]
    fn scope_parse() {
        let scope: Scope = "repository:chainguard/static:pull,push".parse().unwrap();
        assert_eq!(scope.kind, "repository");
        assert_eq!(scope.name, "chainguard/static");
        assert_eq!(scope.actions, "pull,push");
        assert_eq!(scope.to_string(), "repository:chainguard/static:pull,push");

        let registry: Scope = "registry:catalog:*".parse().unwrap();
        assert_eq!(registry.kind, "registry");

        assert!("repository".parse::<Scope>().is_err());
        assert!(":name:pull".parse::<Scope>().is_err());
    }

    #[test]
    fn scope_name_with_port_keeps_actions() {
        let scope: Scope = "repository:localhost:5000/static:pull".parse().unwrap();
        assert_eq!(scope.name, "localhost:5000/static");
        assert_eq!(scope.actions, "pull");
    }

    #[test]
    fn scopes_are_mapped_upstream() {
        let config = Config::new(Upstream::Ghcr)
            .with_repo("distroless")
            .with_prefix("chainguard");
        let mapping = Mapping::new(&config, Some("cgr.dev"));

        assert_eq!(
            map_scopes("repository:chainguard/static:pull", &mapping),
            "repository:distroless/static:pull"
        );
        assert_eq!(
            map_scopes(
                "repository:chainguard/static:pull registry:catalog:*",
                &mapping
            ),
            "repository:distroless/static:pull registry:catalog:*"
        );
        assert_eq!(map_scopes("garbage", &mapping), "garbage");
    }

    #[test]
    fn token_response_fields() {
        let response: TokenResponse = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(response.into_token().unwrap().revealed(), "abc");

        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"xyz","expires_in":300}"#).unwrap();
        assert_eq!(response.into_token().unwrap().revealed(), "xyz");

        let response: TokenResponse = serde_json::from_str("{}").unwrap();
        assert!(response.into_token().is_err());
    }

    #[test]
    fn token_is_hidden() {
        let token = Token::from("secret garden".to_owned());
        assert_eq!(format!("{token:?}"), "Token(****)");

        let header = token.bearer().unwrap();
        assert!(header.is_sensitive());
        assert_eq!(header, "Bearer secret garden");
    }
}
