//! # Redirecting Container Registry
//!
//! A read-only front for the [OCI Distribution API](https://github.com/opencontainers/distribution-spec)
//! which serves images under a vanity host and repository path while the
//! content lives in another registry (GHCR, GCR or any registry with the same
//! token layout).
//!
//! ## Features
//!
//! - Manifest, blob and tag-list requests forwarded to the upstream
//! - Visible repository names mapped onto an upstream repository, with an
//!   optional required prefix and hosts exempt from it
//! - Anonymous pull tokens fetched on behalf of clients without credentials
//! - Token realms, pagination links and tag-list names rewritten back into
//!   the visible names
//! - Blob redirects passed through to the client untouched
//!
//! ## Example
//!
//! ```no_run
//! use registry_redirect::{Config, RedirectBuilder, Upstream};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(Upstream::Ghcr)
//!     .with_repo("distroless")
//!     .with_prefix("chainguard");
//!
//! let app = RedirectBuilder::new(config).build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod body;
pub mod challenge;
mod config;
mod error;
mod headers;
pub mod link;
mod path;
mod proxy;
mod rewrite;
mod route;
pub mod token;
pub mod upstream;

pub use api::RedirectBuilder;
pub use config::{BlobBodies, Config, ConfigError, ConfigFile, Upstream};
pub use error::{RedirectError, RedirectResult, UpstreamStatus};
pub use path::Mapping;
pub use rewrite::TagList;
pub use upstream::{RetryPolicy, UpstreamClient};
