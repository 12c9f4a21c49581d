//! `Link` pagination headers.
//!
//! Tag listings page with `Link: </v2/<repo>/tags/list?n=..&last=..>; rel="next"`.
//! The repository in those links is upstream's, so it is mapped back before the
//! header reaches the client.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::config::Upstream;
use crate::path::Mapping;

/// A malformed `Link` header.
#[derive(Debug, thiserror::Error)]
#[error("malformed link header: {0}")]
pub struct LinkError(&'static str);

/// One link-value: a target URI reference and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkValue {
    target: String,
    params: Vec<(String, Option<String>)>,
}

impl LinkValue {
    /// The URI reference between `<` and `>`.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Look up a parameter by name, ignoring case.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Every link-value in a `Link` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Links(Vec<LinkValue>);

impl Links {
    /// Link values in header order.
    pub fn iter(&self) -> impl Iterator<Item = &LinkValue> {
        self.0.iter()
    }

    /// Rewrite upstream tag-list links into the client's repository space.
    ///
    /// Returns `true` when any target changed.
    pub fn rewrite(&mut self, upstream: &Upstream, mapping: &Mapping<'_>) -> bool {
        let mut changed = false;
        for link in &mut self.0 {
            if let Some(target) = rewrite_target(&link.target, upstream, mapping) {
                link.target = target;
                changed = true;
            }
        }
        changed
    }
}

fn rewrite_target(target: &str, upstream: &Upstream, mapping: &Mapping<'_>) -> Option<String> {
    let relative = match Url::parse(target) {
        Ok(url) => {
            let authority = match (url.host_str(), url.port()) {
                (Some(name), Some(port)) => format!("{name}:{port}"),
                (Some(name), None) => name.to_owned(),
                (None, _) => return None,
            };
            if !authority.eq_ignore_ascii_case(upstream.host()) {
                return None;
            }
            match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_owned(),
            }
        }
        Err(_) => target.to_owned(),
    };

    let (path, query) = match relative.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (relative.as_str(), None),
    };

    let mapped = path
        .strip_prefix("/v2/")
        .and_then(|rest| rest.strip_suffix("/tags/list"))
        .and_then(|repository| mapping.to_client(repository))
        .filter(|repository| !repository.is_empty())
        .map(|repository| format!("/v2/{repository}/tags/list"));

    let path = match mapped {
        Some(path) => path,
        None if relative != target => path.to_owned(),
        None => return None,
    };

    let rewritten = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    (rewritten != target).then_some(rewritten)
}

impl FromStr for Links {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut links = Vec::new();
        let mut rest = s.trim();

        while !rest.is_empty() {
            let inner = rest
                .strip_prefix('<')
                .ok_or(LinkError("expected '<' at start of link-value"))?;
            let end = inner.find('>').ok_or(LinkError("unterminated target"))?;
            let target = inner[..end].trim().to_owned();
            rest = inner[end + 1..].trim_start();

            let mut params = Vec::new();
            while let Some(param) = rest.strip_prefix(';') {
                rest = param.trim_start();
                let name_end = rest
                    .find(|c: char| c == '=' || c == ';' || c == ',' || c.is_whitespace())
                    .unwrap_or(rest.len());
                let name = rest[..name_end].to_owned();
                if name.is_empty() {
                    return Err(LinkError("empty parameter name"));
                }
                rest = rest[name_end..].trim_start();

                let value = if let Some(value) = rest.strip_prefix('=') {
                    let value = value.trim_start();
                    if let Some(quoted) = value.strip_prefix('"') {
                        let close = quoted.find('"').ok_or(LinkError("unterminated quote"))?;
                        rest = quoted[close + 1..].trim_start();
                        Some(quoted[..close].to_owned())
                    } else {
                        let end = value.find([';', ',']).unwrap_or(value.len());
                        rest = value[end..].trim_start();
                        Some(value[..end].trim().to_owned())
                    }
                } else {
                    None
                };
                params.push((name, value));
            }

            links.push(LinkValue { target, params });

            if let Some(next) = rest.strip_prefix(',') {
                rest = next.trim_start();
            } else if !rest.is_empty() {
                return Err(LinkError("expected ',' between link-values"));
            }
        }

        if links.is_empty() {
            return Err(LinkError("no link-values"));
        }
        Ok(Links(links))
    }
}

impl fmt::Display for LinkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.target)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, "; {name}=\"{value}\"")?,
                None => write!(f, "; {name}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Links {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, link) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{link}")?;
        }
        Ok(())
    }
}

/// Rewrite a `Link` header value. Returns `None` when it is left as it was.
pub(crate) fn rewrite(value: &str, upstream: &Upstream, mapping: &Mapping<'_>) -> Option<String> {
    let mut links: Links = value.parse().ok()?;
    links
        .rewrite(upstream, mapping)
        .then(|| links.to_string())
}
