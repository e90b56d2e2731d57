//! shellgate - browser remote-shell gateway
//!
//! Serves one WebSocket endpoint through which an authenticated browser can
//! open persistent pty terminals and run one-shot commands on this host.

use anyhow::Context;
use clap::Parser as ClapParser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shellgate::{
    api,
    config::{self, FileConfig, GatewayConfig, Overrides},
    context::ServerContext,
};

/// How long WebSocket handlers get to send close frames before the listener
/// stops.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_millis(200);

/// shellgate - browser remote-shell gateway
#[derive(ClapParser, Debug)]
#[command(name = "shellgate", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server (default 127.0.0.1:3000)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on when --bind is not given
    #[arg(long, env = "PORT", hide = true)]
    port: Option<u16>,

    /// Shared key clients must present; generated when not set
    #[arg(long, env = "SHELLGATE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Shell for persistent terminals (overrides $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Working directory for new terminals and one-shot commands
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// How long a command waits for its terminal to start
    #[arg(long)]
    ready_timeout_ms: Option<u64>,

    /// How long ids of finished commands stay killable
    #[arg(long)]
    retention_secs: Option<u64>,

    /// Allowed CORS origin (repeatable)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            port: self.port,
            key: self.key.clone(),
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            ready_timeout_ms: self.ready_timeout_ms,
            retention_secs: self.retention_secs,
            cors_origins: self.cors_origins.clone(),
        }
    }
}

fn generate_key() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let file = match cli.config.clone().or_else(FileConfig::default_path) {
        Some(path) => {
            let file = FileConfig::load(&path)?;
            if file.as_ref().is_some_and(|f| f.key.is_some()) {
                config::check_config_permissions(&path);
            }
            file
        }
        None => None,
    };
    Ok(GatewayConfig::resolve(file, cli.overrides())?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    let key = match config.key.clone() {
        Some(key) => key,
        None => {
            let key = generate_key();
            eprintln!("shellgate: access key: {}", key);
            key
        }
    };

    let bind = config.bind;
    tracing::info!(
        addr = %bind,
        shell = %config.shell,
        cwd = %config.default_cwd.display(),
        "shellgate starting"
    );

    let ctx = ServerContext::new(config, key);
    let app = api::router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Tell WebSocket handlers to send close frames, then give them a
            // moment before the listener stops.
            shutdown_ctx.shutdown_token().cancel();
            tokio::time::sleep(CLOSE_GRACE).await;
        })
        .await
        .context("HTTP server failed")?;

    let killed = ctx.shutdown_all();
    tracing::info!(processes = killed, "shellgate exiting");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shellgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(?e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("received Ctrl+C");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C");
    }
}
