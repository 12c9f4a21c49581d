//! Configuration for the redirecting registry.
//!
//! A [`Config`] is assembled once at startup and then shared read-only by every
//! request handler.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use url::Url;

/// Errors found while assembling a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The upstream registry is neither a known registry nor a valid host.
    #[error("invalid upstream registry: {0:?}")]
    InvalidUpstream(String),

    /// Unknown blob body policy.
    #[error("invalid blob body policy: {0:?} (expected \"proxy\" or \"drop\")")]
    InvalidBlobBodies(String),

    /// The documentation URL cannot be used as a base for redirects.
    #[error("documentation URL cannot be a base: {0}")]
    InvalidDocs(Url),

    /// The realm scheme is not http or https.
    #[error("invalid realm scheme: {0:?}")]
    InvalidRealmScheme(String),

    /// The configuration file is not valid TOML for this service.
    #[cfg(feature = "cli")]
    #[error("configuration file: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

/// The registry which actually serves image content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Upstream {
    /// GitHub Container Registry
    #[default]
    Ghcr,

    /// Google Container Registry
    Gcr,

    /// Any other registry following the GHCR token layout, by host.
    Custom(String),
}

impl Upstream {
    /// Host (and port, for custom registries) of the upstream.
    pub fn host(&self) -> &str {
        match self {
            Upstream::Ghcr => "ghcr.io",
            Upstream::Gcr => "gcr.io",
            Upstream::Custom(host) => host,
        }
    }

    /// Base URL of the distribution API, ending in `/v2/`.
    pub fn registry_base(&self) -> String {
        format!("https://{}/v2/", self.host())
    }

    /// Path of the upstream's token endpoint.
    pub fn token_path(&self) -> &'static str {
        match self {
            Upstream::Gcr => "/v2/token",
            Upstream::Ghcr | Upstream::Custom(_) => "/token",
        }
    }

    /// Full URL of the upstream's token endpoint.
    pub fn token_endpoint(&self) -> String {
        format!("https://{}{}", self.host(), self.token_path())
    }

    /// Value of the `service` parameter in token requests.
    pub fn service(&self) -> &str {
        self.host()
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.host())
    }
}

impl FromStr for Upstream {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let host = s.trim().trim_end_matches('/').to_ascii_lowercase();
        match host.as_str() {
            "ghcr" | "ghcr.io" => Ok(Upstream::Ghcr),
            "gcr" | "gcr.io" => Ok(Upstream::Gcr),
            "" => Err(ConfigError::InvalidUpstream(s.to_owned())),
            other => match other.parse::<http::uri::Authority>() {
                Ok(authority) if authority.as_str() == other => {
                    Ok(Upstream::Custom(other.to_owned()))
                }
                _ => Err(ConfigError::InvalidUpstream(s.to_owned())),
            },
        }
    }
}

impl TryFrom<String> for Upstream {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What to do with the body of a blob response which is not a redirect.
///
/// Upstream registries nearly always answer blob requests with a redirect to a
/// CDN. When they don't, the body can be streamed through (`Proxy`) or dropped
/// to avoid paying egress for layer contents (`Drop`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBodies {
    /// Stream non-redirect blob bodies to the client.
    #[default]
    Proxy,

    /// Discard non-redirect blob bodies.
    Drop,
}

impl FromStr for BlobBodies {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(BlobBodies::Proxy),
            "drop" => Ok(BlobBodies::Drop),
            _ => Err(ConfigError::InvalidBlobBodies(s.to_owned())),
        }
    }
}

/// Immutable settings for one redirecting registry.
#[derive(Debug, Clone)]
pub struct Config {
    upstream: Upstream,
    repo: String,
    prefix: String,
    prefixless_hosts: BTreeSet<String>,
    docs: Option<Url>,
    blob_bodies: BlobBodies,
    realm_scheme: String,
}

impl Config {
    /// Create a pass-through configuration for an upstream registry.
    pub fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            repo: String::new(),
            prefix: String::new(),
            prefixless_hosts: BTreeSet::new(),
            docs: None,
            blob_bodies: BlobBodies::default(),
            realm_scheme: "https".to_owned(),
        }
    }

    /// Set the upstream repository which visible repositories live under.
    pub fn with_repo(mut self, repo: impl AsRef<str>) -> Self {
        self.repo = repo.as_ref().trim_matches('/').to_owned();
        self
    }

    /// Require visible repositories to start with this prefix.
    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.prefix = prefix.as_ref().trim_matches('/').to_owned();
        self
    }

    /// Exempt a hostname from the prefix requirement.
    pub fn with_prefixless_host(mut self, host: impl AsRef<str>) -> Self {
        let host = host.as_ref().trim().to_ascii_lowercase();
        if !host.is_empty() {
            self.prefixless_hosts.insert(host);
        }
        self
    }

    /// Redirect unknown paths to this documentation site instead of returning 404.
    pub fn with_docs(mut self, docs: Url) -> Result<Self, ConfigError> {
        if docs.cannot_be_a_base() {
            return Err(ConfigError::InvalidDocs(docs));
        }

        let mut docs = docs;
        if !docs.path().ends_with('/') {
            let path = format!("{}/", docs.path());
            docs.set_path(&path);
        }
        self.docs = Some(docs);
        Ok(self)
    }

    /// Set the blob body policy.
    pub fn with_blob_bodies(mut self, policy: BlobBodies) -> Self {
        self.blob_bodies = policy;
        self
    }

    /// Set the scheme used when pointing token realms back at this service.
    pub fn with_realm_scheme(mut self, scheme: impl AsRef<str>) -> Result<Self, ConfigError> {
        let scheme = scheme.as_ref().to_ascii_lowercase();
        if scheme != "https" && scheme != "http" {
            return Err(ConfigError::InvalidRealmScheme(scheme));
        }
        self.realm_scheme = scheme;
        Ok(self)
    }

    /// The upstream registry.
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Upstream repository prepended to every visible repository, may be empty.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Visible prefix required by default, may be empty.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hosts allowed to omit the prefix.
    pub fn prefixless_hosts(&self) -> impl Iterator<Item = &str> {
        self.prefixless_hosts.iter().map(String::as_str)
    }

    /// Documentation site for unknown paths.
    pub fn docs(&self) -> Option<&Url> {
        self.docs.as_ref()
    }

    /// Blob body policy.
    pub fn blob_bodies(&self) -> BlobBodies {
        self.blob_bodies
    }

    /// Scheme of rewritten token realms.
    pub fn realm_scheme(&self) -> &str {
        &self.realm_scheme
    }

    /// Whether a request arriving for `host` must carry the visible prefix.
    ///
    /// Requests without a `Host` are held to the prefix.
    pub fn requires_prefix(&self, host: Option<&str>) -> bool {
        if self.prefix.is_empty() {
            return false;
        }

        match host {
            Some(host) => !self.is_prefixless(host),
            None => true,
        }
    }

    fn is_prefixless(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        if self.prefixless_hosts.contains(&host) {
            return true;
        }

        match host.rsplit_once(':') {
            Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                self.prefixless_hosts.contains(name)
            }
            _ => false,
        }
    }
}

/// Settings read from a TOML configuration file.
///
/// Every field is optional so command line arguments can fill or override them.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Upstream registry
    pub upstream: Option<Upstream>,

    /// Upstream repository
    pub repo: Option<String>,

    /// Visible prefix
    pub prefix: Option<String>,

    /// Hosts exempt from the prefix
    #[serde(default)]
    pub prefixless_hosts: Vec<String>,

    /// Documentation site for unknown paths
    pub docs_url: Option<Url>,

    /// Blob body policy
    pub blob_bodies: Option<BlobBodies>,

    /// Scheme of rewritten token realms
    pub realm_scheme: Option<String>,

    /// Transparent retries for idempotent upstream requests
    pub retries: Option<usize>,

    /// Upstream request timeout, in seconds
    pub timeout: Option<u64>,

    /// Listening port
    pub port: Option<u16>,
}

impl ConfigFile {
    /// Parse a configuration file.
    #[cfg(feature = "cli")]
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml_edit::de::from_str(text)?)
    }
}
