//! Rewriting upstream responses into the client's repository space.

use axum::http::{HeaderMap, HeaderValue, header};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::headers;
use crate::path::Mapping;
use crate::{challenge, link};

/// Headers for the client's response.
///
/// Hop-by-hop headers are dropped and every value of multi-value headers is
/// kept. `Www-Authenticate` realms and `Link` targets are rewritten when they
/// point at the upstream.
pub fn response_headers(
    upstream: &HeaderMap,
    config: &Config,
    mapping: &Mapping<'_>,
    host: Option<&str>,
) -> HeaderMap {
    let mut out = headers::relayed(upstream);

    if let Some(host) = host {
        rewrite_values(&mut out, header::WWW_AUTHENTICATE, |value| {
            challenge::rewrite(value, config, host)
        });
    }
    rewrite_values(&mut out, header::LINK, |value| {
        link::rewrite(value, config.upstream(), mapping)
    });

    out
}

fn rewrite_values<F>(headers: &mut HeaderMap, name: header::HeaderName, rewrite: F)
where
    F: Fn(&str) -> Option<String>,
{
    let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
    if values.is_empty() {
        return;
    }

    headers.remove(&name);
    for value in values {
        let rewritten = value
            .to_str()
            .ok()
            .and_then(&rewrite)
            .and_then(|text| {
                tracing::debug!(header = %name, before = ?value, after = %text, "rewrote header");
                HeaderValue::try_from(text).ok()
            });
        headers.append(name.clone(), rewritten.unwrap_or(value));
    }
}

/// A tag listing, `GET /v2/<name>/tags/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagList {
    /// Repository name
    pub name: String,

    /// Tags, `null` for an empty repository on some registries.
    pub tags: Option<Vec<String>>,
}

/// Re-encode a tag listing with its name mapped back to the client's repository.
///
/// Names outside the configured upstream repository are left alone.
pub fn tag_list(body: &[u8], mapping: &Mapping<'_>) -> Result<Bytes, serde_json::Error> {
    let mut list: TagList = serde_json::from_slice(body)?;
    if let Some(name) = mapping
        .to_client(&list.name)
        .filter(|name| !name.is_empty())
    {
        tracing::debug!(before = %list.name, after = %name, "rewrote tag list name");
        list.name = name;
    }
    Ok(Bytes::from(serde_json::to_vec(&list)?))
}
