//! Registry protocol routes.
//!
//! Routes are an ordered list of path templates. The repository in a proxied
//! path may contain slashes: it is everything between `/v2/` and the final two
//! path segments.

use axum::http::Method;

use crate::error::{RedirectError, RedirectResult};

/// Which registry endpoint family a proxied path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `/v2/{repo}/manifests/{reference}`
    Manifests,

    /// `/v2/{repo}/blobs/{digest}`
    Blobs,

    /// `/v2/{repo}/tags/list`
    Tags,
}

impl Kind {
    /// The path segment naming this endpoint family.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Manifests => "manifests",
            Kind::Blobs => "blobs",
            Kind::Tags => "tags",
        }
    }
}

/// A repository-scoped registry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Repository as the client named it, may contain `/`.
    pub repository: String,

    /// Endpoint family
    pub kind: Kind,

    /// Tag or digest, or `list` for tag listings.
    pub reference: String,
}

impl Target {
    /// Path below the repository, e.g. `manifests/latest`.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.reference)
    }

    /// Whether this is a blob request.
    pub fn is_blob(&self) -> bool {
        self.kind == Kind::Blobs
    }

    /// Whether this is a tag listing.
    pub fn is_tag_list(&self) -> bool {
        self.kind == Kind::Tags
    }
}

/// The handler selected for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// API version check
    Ping,

    /// Token relay
    Token,

    /// Repository-scoped proxy request
    Proxy(Target),

    /// Nothing matched
    NotFound,
}

#[derive(Debug, Clone, Copy)]
enum Fixed {
    Ping,
    Token,
}

#[derive(Debug, Clone, Copy)]
enum Template {
    Exact(&'static str, Fixed),
    Repository(Kind),
}

const ROUTES: &[Template] = &[
    Template::Exact("/v2", Fixed::Ping),
    Template::Exact("/v2/", Fixed::Ping),
    Template::Exact("/token", Fixed::Token),
    Template::Repository(Kind::Manifests),
    Template::Repository(Kind::Blobs),
    Template::Repository(Kind::Tags),
];

impl Template {
    fn matches(&self, path: &str) -> Option<Route> {
        match self {
            Template::Exact(template, fixed) => (path == *template).then(|| match fixed {
                Fixed::Ping => Route::Ping,
                Fixed::Token => Route::Token,
            }),
            Template::Repository(kind) => {
                let rest = path.strip_prefix("/v2/")?;
                let mut segments = rest.rsplitn(3, '/');
                let reference = segments.next()?;
                let family = segments.next()?;
                let repository = segments.next()?;

                if family != kind.as_str() || reference.is_empty() || repository.is_empty() {
                    return None;
                }
                if *kind == Kind::Tags && reference != "list" {
                    return None;
                }

                Some(Route::Proxy(Target {
                    repository: repository.to_owned(),
                    kind: *kind,
                    reference: reference.to_owned(),
                }))
            }
        }
    }
}

/// Select the route for a request.
///
/// Mutating methods are rejected before any path matching happens.
pub fn resolve(method: &Method, path: &str) -> RedirectResult<Route> {
    if method != Method::GET && method != Method::HEAD {
        return Err(RedirectError::ReadOnly(method.clone()));
    }

    Ok(ROUTES
        .iter()
        .find_map(|template| template.matches(path))
        .unwrap_or(Route::NotFound))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(repository: &str, kind: Kind, reference: &str) -> Route {
        Route::Proxy(Target {
            repository: repository.into(),
            kind,
            reference: reference.into(),
        })
    }

    #[test]
    fn ping_and_token() {
        assert_eq!(resolve(&Method::GET, "/v2").unwrap(), Route::Ping);
        assert_eq!(resolve(&Method::GET, "/v2/").unwrap(), Route::Ping);
        assert_eq!(resolve(&Method::HEAD, "/token").unwrap(), Route::Token);
    }

    #[test]
    fn repository_routes() {
        assert_eq!(
            resolve(&Method::GET, "/v2/static/manifests/latest").unwrap(),
            proxy("static", Kind::Manifests, "latest")
        );
        assert_eq!(
            resolve(&Method::HEAD, "/v2/chainguard/static/blobs/sha256:abcd").unwrap(),
            proxy("chainguard/static", Kind::Blobs, "sha256:abcd")
        );
        assert_eq!(
            resolve(&Method::GET, "/v2/a/b/c/tags/list").unwrap(),
            proxy("a/b/c", Kind::Tags, "list")
        );
    }

    #[test]
    fn repository_is_everything_before_last_two_segments() {
        assert_eq!(
            resolve(&Method::GET, "/v2/tools/manifests/manifests/v1").unwrap(),
            proxy("tools/manifests", Kind::Manifests, "v1")
        );
    }

    #[test]
    fn unknown_paths() {
        for path in [
            "/",
            "/v2/static",
            "/v2/manifests/latest",
            "/v2/static/manifests/",
            "/v2/static/tags/all",
            "/v2/_catalog",
            "/token/extra",
            "/v3/static/manifests/latest",
        ] {
            assert_eq!(resolve(&Method::GET, path).unwrap(), Route::NotFound, "{path}");
        }
    }

    #[test]
    fn mutating_methods_are_rejected() {
        for method in [Method::PUT, Method::POST, Method::DELETE, Method::PATCH] {
            let err = resolve(&method, "/v2/static/manifests/latest").unwrap_err();
            assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        }

        assert!(resolve(&Method::POST, "/nowhere").is_err());
    }
}
