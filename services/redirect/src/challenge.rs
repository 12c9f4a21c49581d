//! `Www-Authenticate` challenges.
//!
//! Registries answer unauthenticated requests with a bearer challenge whose
//! `realm` names the token endpoint. The realm is pointed back at this service
//! so clients fetch tokens through the scope-rewriting relay.

use std::fmt;
use std::str::FromStr;

use http_auth::ChallengeRef;
use http_auth::parser::ChallengeParser;
use url::Url;

use crate::config::{Config, Upstream};

/// A malformed `Www-Authenticate` value.
#[derive(Debug, thiserror::Error)]
#[error("malformed challenge: {0}")]
pub struct ChallengeError(String);

/// A single authentication challenge, e.g. `Bearer realm="...",service="..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    params: Vec<(String, String)>,
}

impl Challenge {
    /// The authentication scheme, e.g. `Bearer`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Look up a parameter by name, ignoring case.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace the value of a parameter, or add it.
    pub fn set_param(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .params
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => self.params.push((name.to_owned(), value)),
        }
    }

    /// Point an upstream token realm at `host` on this service.
    ///
    /// Returns `false` when the realm does not belong to the upstream, in which
    /// case the challenge is untouched.
    pub fn redirect_realm(&mut self, upstream: &Upstream, scheme: &str, host: &str) -> bool {
        let Some(realm) = self.param("realm").and_then(|realm| Url::parse(realm).ok()) else {
            return false;
        };

        let authority = match (realm.host_str(), realm.port()) {
            (Some(name), Some(port)) => format!("{name}:{port}"),
            (Some(name), None) => name.to_owned(),
            (None, _) => return false,
        };
        if !authority.eq_ignore_ascii_case(upstream.host()) {
            return false;
        }

        let path = if realm.path() == upstream.token_path() {
            "/token"
        } else {
            realm.path()
        };

        let mut redirected = format!("{scheme}://{host}{path}");
        if let Some(query) = realm.query() {
            redirected.push('?');
            redirected.push_str(query);
        }

        self.set_param("realm", redirected);
        true
    }
}

impl From<ChallengeRef<'_>> for Challenge {
    fn from(challenge: ChallengeRef<'_>) -> Self {
        Challenge {
            scheme: challenge.scheme.to_owned(),
            params: challenge
                .params
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_unescaped()))
                .collect(),
        }
    }
}

impl FromStr for Challenge {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Challenges(mut challenges) = s.parse()?;
        match challenges.pop() {
            Some(challenge) if challenges.is_empty() => Ok(challenge),
            _ => Err(ChallengeError("expected a single challenge".into())),
        }
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme)?;
        for (idx, (name, value)) in self.params.iter().enumerate() {
            let sep = if idx == 0 { " " } else { "," };
            write!(f, "{sep}{name}=\"")?;
            for c in value.chars() {
                if c == '"' || c == '\\' {
                    f.write_str("\\")?;
                }
                write!(f, "{c}")?;
            }
            f.write_str("\"")?;
        }
        Ok(())
    }
}

/// Every challenge in one `Www-Authenticate` value, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenges(Vec<Challenge>);

impl Challenges {
    /// The parsed challenges.
    pub fn iter(&self) -> impl Iterator<Item = &Challenge> {
        self.0.iter()
    }

    /// Point every upstream token realm at `host` on this service.
    ///
    /// Returns `true` when any challenge changed.
    pub fn redirect_realm(&mut self, upstream: &Upstream, scheme: &str, host: &str) -> bool {
        let mut changed = false;
        for challenge in &mut self.0 {
            changed |= challenge.redirect_realm(upstream, scheme, host);
        }
        changed
    }
}

impl FromStr for Challenges {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let challenges = ChallengeParser::new(s)
            .map(|challenge| {
                challenge
                    .map(Challenge::from)
                    .map_err(|err| ChallengeError(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if challenges.is_empty() {
            return Err(ChallengeError("no challenges".into()));
        }
        Ok(Challenges(challenges))
    }
}

impl fmt::Display for Challenges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, challenge) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{challenge}")?;
        }
        Ok(())
    }
}

/// Rewrite a `Www-Authenticate` value so its realm points at this service.
///
/// Returns `None` when the value is left as it was.
pub(crate) fn rewrite(value: &str, config: &Config, host: &str) -> Option<String> {
    let mut challenges: Challenges = value.parse().ok()?;
    challenges
        .redirect_realm(config.upstream(), config.realm_scheme(), host)
        .then(|| challenges.to_string())
}
