//! Mapping between visible repository names and upstream repository names.

use crate::config::Config;
use crate::error::{RedirectError, RedirectResult};
use crate::route::Target;

/// Repository mapping for one request, fixed by the host it arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Mapping<'a> {
    config: &'a Config,
    prefixed: bool,
}

impl<'a> Mapping<'a> {
    /// Build the mapping for a request which arrived for `host`.
    pub fn new(config: &'a Config, host: Option<&str>) -> Self {
        Self {
            config,
            prefixed: config.requires_prefix(host),
        }
    }

    /// Whether the visible prefix is part of repository names for this request.
    pub fn prefixed(&self) -> bool {
        self.prefixed
    }

    /// Map a visible repository to its upstream name.
    ///
    /// Fails with a `MANIFEST_UNKNOWN` registry error when the prefix is
    /// required but missing.
    pub fn to_upstream(&self, repository: &str) -> RedirectResult<String> {
        let rest = if self.prefixed {
            self.strip_prefix(repository)
                .ok_or_else(|| RedirectError::MissingPrefix {
                    prefix: self.config.prefix().to_owned(),
                    repository: repository.to_owned(),
                })?
        } else {
            repository
        };

        let upstream = join(self.config.repo(), rest);
        if upstream.is_empty() {
            return Err(RedirectError::MissingPrefix {
                prefix: self.config.prefix().to_owned(),
                repository: repository.to_owned(),
            });
        }
        Ok(upstream)
    }

    /// Map a visible repository to its upstream name, leaving a missing prefix alone.
    ///
    /// Token scopes are not registry paths, so they are never rejected.
    pub fn scope_to_upstream(&self, repository: &str) -> String {
        let rest = if self.prefixed {
            self.strip_prefix(repository).unwrap_or(repository)
        } else {
            repository
        };
        join(self.config.repo(), rest)
    }

    /// Map an upstream repository back to the name the client sees.
    ///
    /// Returns `None` for repositories outside the configured upstream repo.
    pub fn to_client(&self, upstream: &str) -> Option<String> {
        let repo = self.config.repo();
        let rest = if repo.is_empty() {
            upstream
        } else if upstream == repo {
            ""
        } else {
            upstream.strip_prefix(repo)?.strip_prefix('/')?
        };

        if self.prefixed {
            Some(join(self.config.prefix(), rest))
        } else {
            Some(rest.to_owned())
        }
    }

    /// Upstream URL for a proxied registry request, with the client's query re-attached.
    pub fn upstream_url(&self, target: &Target, query: Option<&str>) -> RedirectResult<String> {
        let repository = self.to_upstream(&target.repository)?;
        let mut url = format!(
            "{}{}/{}",
            self.config.upstream().registry_base(),
            repository,
            target.endpoint()
        );
        if let Some(query) = query.filter(|query| !query.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }

    fn strip_prefix<'r>(&self, repository: &'r str) -> Option<&'r str> {
        let prefix = self.config.prefix();
        if repository == prefix {
            return Some("");
        }
        repository.strip_prefix(prefix)?.strip_prefix('/')
    }
}

fn join(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_owned(),
        (false, true) => head.to_owned(),
        (false, false) => format!("{head}/{tail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Upstream;
    use crate::route::Kind;

    fn target(repository: &str, kind: Kind, reference: &str) -> Target {
        Target {
            repository: repository.to_owned(),
            kind,
            reference: reference.to_owned(),
        }
    }

    #[test]
    fn repo_without_prefix() {
        let config = Config::new(Upstream::Ghcr).with_repo("distroless");
        let mapping = Mapping::new(&config, Some("distroless.dev"));

        let url = mapping
            .upstream_url(&target("static", Kind::Manifests, "latest"), None)
            .unwrap();
        assert_eq!(url, "https://ghcr.io/v2/distroless/static/manifests/latest");
    }

    #[test]
    fn prefix_is_required_and_stripped() {
        let config = Config::new(Upstream::Ghcr)
            .with_repo("distroless")
            .with_prefix("chainguard");
        let mapping = Mapping::new(&config, Some("cgr.dev"));

        let err = mapping
            .upstream_url(&target("static", Kind::Manifests, "latest"), None)
            .unwrap_err();
        assert_eq!(err.error_code(), "MANIFEST_UNKNOWN");

        let url = mapping
            .upstream_url(&target("chainguard/static", Kind::Manifests, "latest"), None)
            .unwrap();
        assert_eq!(url, "https://ghcr.io/v2/distroless/static/manifests/latest");
    }

    #[test]
    fn prefix_must_be_a_whole_segment() {
        let config = Config::new(Upstream::Ghcr)
            .with_repo("distroless")
            .with_prefix("chainguard");
        let mapping = Mapping::new(&config, None);

        assert!(mapping.to_upstream("chainguardian/static").is_err());
        assert_eq!(mapping.to_upstream("chainguard").unwrap(), "distroless");
    }

    #[test]
    fn prefixless_host_skips_prefix() {
        let config = Config::new(Upstream::Ghcr)
            .with_repo("dagger")
            .with_prefix("dagger")
            .with_prefixless_host("registry.dagger.io");
        let mapping = Mapping::new(&config, Some("registry.dagger.io"));

        assert!(!mapping.prefixed());
        assert_eq!(mapping.to_upstream("engine").unwrap(), "dagger/engine");
        assert_eq!(mapping.to_client("dagger/engine").unwrap(), "engine");
    }

    #[test]
    fn pass_through_is_identity() {
        let config = Config::new(Upstream::Gcr);
        let mapping = Mapping::new(&config, Some("mirror.example.dev"));

        let url = mapping
            .upstream_url(
                &target("distroless/static", Kind::Tags, "list"),
                Some("n=10&last=v1"),
            )
            .unwrap();
        assert_eq!(url, "https://gcr.io/v2/distroless/static/tags/list?n=10&last=v1");
        assert_eq!(
            mapping.to_client("distroless/static").unwrap(),
            "distroless/static"
        );
    }

    #[test]
    fn to_client_reinserts_prefix() {
        let config = Config::new(Upstream::Ghcr)
            .with_repo("distroless")
            .with_prefix("chainguard");
        let mapping = Mapping::new(&config, Some("cgr.dev"));

        assert_eq!(
            mapping.to_client("distroless/static").unwrap(),
            "chainguard/static"
        );
        assert!(mapping.to_client("distrolessish/static").is_none());
        assert!(mapping.to_client("other/static").is_none());
    }

    #[test]
    fn scopes_tolerate_missing_prefix() {
        let config = Config::new(Upstream::Ghcr)
            .with_repo("distroless")
            .with_prefix("chainguard");
        let mapping = Mapping::new(&config, None);

        assert_eq!(
            mapping.scope_to_upstream("chainguard/static"),
            "distroless/static"
        );
        assert_eq!(mapping.scope_to_upstream("static"), "distroless/static");
    }

    #[test]
    fn nested_repositories() {
        let config = Config::new(Upstream::Ghcr).with_repo("org/images");
        let mapping = Mapping::new(&config, None);

        assert_eq!(
            mapping.to_upstream("team/tool").unwrap(),
            "org/images/team/tool"
        );
        assert_eq!(mapping.to_client("org/images/team/tool").unwrap(), "team/tool");
    }
}
