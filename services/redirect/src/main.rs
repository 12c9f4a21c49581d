//! Redirecting registry server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr as _;
use registry_redirect::{
    BlobBodies, Config, ConfigError, ConfigFile, RedirectBuilder, RetryPolicy, Upstream,
    UpstreamClient,
};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Time in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Serve container images from another registry under a vanity name.
#[derive(Debug, Parser)]
#[command(name = "registry-redirect", version, about)]
struct Args {
    /// TOML configuration file; command line and environment take precedence
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Upstream registry: `ghcr`, `gcr`, or a registry host
    #[arg(long, env = "UPSTREAM")]
    upstream: Option<Upstream>,

    /// Shorthand for `--upstream gcr`
    #[arg(long)]
    gcr: bool,

    /// Upstream repository which visible repositories live under
    #[arg(long, env = "REPO")]
    repo: Option<String>,

    /// Prefix visible repositories must start with
    #[arg(long, env = "PREFIX")]
    prefix: Option<String>,

    /// Host allowed to omit the prefix (repeatable)
    #[arg(
        long = "prefixless-host",
        env = "PREFIXLESS_HOSTS",
        value_delimiter = ','
    )]
    prefixless_hosts: Vec<String>,

    /// Redirect unknown paths to this documentation site
    #[arg(long, env = "DOCS_URL")]
    docs_url: Option<Url>,

    /// What to do with blob bodies which are not redirects: `proxy` or `drop`
    #[arg(long, env = "BLOB_BODIES")]
    blob_bodies: Option<BlobBodies>,

    /// Scheme of token realms pointing back at this service
    #[arg(long, env = "REALM_SCHEME")]
    realm_scheme: Option<String>,

    /// Retries for idempotent upstream requests
    #[arg(long, env = "RETRIES")]
    retries: Option<usize>,

    /// Upstream request timeout, in seconds
    #[arg(long, env = "TIMEOUT")]
    timeout: Option<u64>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Everything needed to start the server.
#[derive(Debug)]
struct Settings {
    config: Config,
    retries: usize,
    timeout: Duration,
    port: u16,
}

impl Args {
    /// Layer these arguments over a configuration file.
    fn merge(self, file: ConfigFile) -> Result<Settings, ConfigError> {
        let upstream = if self.gcr {
            Upstream::Gcr
        } else {
            self.upstream.or(file.upstream).unwrap_or_default()
        };

        let mut config = Config::new(upstream)
            .with_repo(self.repo.or(file.repo).unwrap_or_default())
            .with_prefix(self.prefix.or(file.prefix).unwrap_or_default())
            .with_blob_bodies(self.blob_bodies.or(file.blob_bodies).unwrap_or_default());

        let hosts = if self.prefixless_hosts.is_empty() {
            file.prefixless_hosts
        } else {
            self.prefixless_hosts
        };
        for host in hosts {
            config = config.with_prefixless_host(host);
        }

        if let Some(docs) = self.docs_url.or(file.docs_url) {
            config = config.with_docs(docs)?;
        }
        if let Some(scheme) = self.realm_scheme.or(file.realm_scheme) {
            config = config.with_realm_scheme(scheme)?;
        }

        Ok(Settings {
            config,
            retries: self.retries.or(file.retries).unwrap_or(2),
            timeout: Duration::from_secs(self.timeout.or(file.timeout).unwrap_or(60)),
            port: self.port.or(file.port).unwrap_or(8080),
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("unable to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let file = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            ConfigFile::from_toml(&text).wrap_err_with(|| format!("parsing {}", path.display()))?
        }
        None => ConfigFile::default(),
    };
    let settings = args.merge(file)?;

    tracing::info!(
        upstream = %settings.config.upstream(),
        repo = settings.config.repo(),
        prefix = settings.config.prefix(),
        "starting registry redirect"
    );

    let client = UpstreamClient::new(settings.timeout, RetryPolicy::new(settings.retries));
    let app = RedirectBuilder::new(settings.config).upstream(client).build();

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    tracing::info!("listening on http://{addr}");

    let (stop, mut stopped) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.wait_for(|stop| *stop).await;
            })
            .into_future(),
    );

    tokio::select! {
        joined = &mut server => {
            joined??;
            return Ok(());
        }
        () = shutdown_signal() => {}
    }

    tracing::info!("shutting down");
    let _ = stop.send(true);
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("requests still in flight after {SHUTDOWN_GRACE:?}, exiting"),
    }

    Ok(())
}
