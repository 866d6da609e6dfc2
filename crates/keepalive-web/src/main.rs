use anyhow::{Context, Result};
use clap::Parser;
use keepalive_core::KeepaliveConfig;
use keepalive_core::gateway::{DEFAULT_MAX_CONCURRENT, GatewayClient};
use keepalive_core::notify::{BotNotifier, LogNotifier, Notifier};
use keepalive_web::{AppState, build_cors, router};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Keeps chat accounts alive and streams their login codes")]
struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,
    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,
    /// Directory holding one JSON file per task.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Unix socket of the account gateway.
    #[arg(long, env = "TG_GATEWAY_SOCKET", default_value = "/tmp/tg-gateway.sock")]
    gateway_socket: PathBuf,
    /// Max concurrent requests to the gateway.
    #[arg(long, env = "TG_GATEWAY_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    gateway_max_concurrent: usize,
    /// Minimum spacing between gateway requests, in milliseconds.
    #[arg(long, env = "TG_GATEWAY_MIN_INTERVAL_MS", default_value = "500")]
    gateway_min_interval_ms: u64,
    /// Longest flood wait the gateway client sits out before retrying once.
    #[arg(long, env = "TG_FLOOD_WAIT_MAX_SECONDS", default_value = "300")]
    flood_wait_max_seconds: u64,
    /// Bot token for status notifications; notifications are only logged when unset.
    #[arg(long, env = "TG_NOTIFY_BOT_TOKEN", hide_env_values = true)]
    bot_token: Option<String>,
    #[arg(long, env = "TG_NOTIFY_BOT_NAME")]
    bot_name: Option<String>,
    #[arg(long, env = "TG_INTERVAL_SECONDS", default_value = "86400")]
    interval_seconds: u64,
    #[arg(long, env = "TG_JITTER_SECONDS", default_value = "300")]
    jitter_seconds: u64,
    /// Consecutive heartbeat failures before a task is removed.
    #[arg(long, env = "TG_HEART_BEAT_MAX_FAIL", default_value = "3")]
    max_failures: u32,
    #[arg(long, env = "TG_SSE_MAX_CONNECTIONS", default_value = "50")]
    sse_max_connections: usize,
    #[arg(long, env = "TG_SSE_TIMEOUT_SECONDS", default_value = "300")]
    sse_timeout_seconds: u64,
    #[arg(long, env = "TG_LOGIN_TTL_SECONDS", default_value = "600")]
    login_ttl_seconds: u64,
    /// Allowed CORS origins, comma separated; `*` allows any.
    #[arg(long = "allow-origin", env = "ALLOW_ORIGINS", value_delimiter = ',', default_value = "*")]
    allow_origins: Vec<String>,
}

impl Args {
    fn keepalive_config(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            interval: Duration::from_secs(self.interval_seconds),
            jitter: Duration::from_secs(self.jitter_seconds),
            max_consecutive_failures: self.max_failures,
            subscription_capacity: self.sse_max_connections,
            subscription_timeout: Duration::from_secs(self.sse_timeout_seconds),
            login_ttl: Duration::from_secs(self.login_ttl_seconds),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keepalive_web=info,keepalive_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.keepalive_config();

    let client = Arc::new(
        GatewayClient::new(args.gateway_socket.clone(), args.gateway_max_concurrent)
            .with_min_interval(Duration::from_millis(args.gateway_min_interval_ms))
            .with_flood_wait_limit(Duration::from_secs(args.flood_wait_max_seconds)),
    );
    let notifier: Arc<dyn Notifier> = match args.bot_token.as_deref() {
        Some(token) if !token.trim().is_empty() => Arc::new(BotNotifier::new(token)?),
        _ => {
            warn!("TG_NOTIFY_BOT_TOKEN not set, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let state = AppState::start(
        client,
        notifier,
        &args.data_dir,
        &config,
        args.bot_name.clone(),
    )
    .await?;

    let app = router(state.clone()).layer(build_cors(&args.allow_origins)?);
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http listener on {addr}"))?;

    info!(
        gateway = %args.gateway_socket.display(),
        interval_secs = config.interval.as_secs(),
        jitter_secs = config.jitter.as_secs(),
        max_failures = config.max_consecutive_failures,
        "tg-keepalive listening on http://{addr}"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            state.shutdown().await;
        })
        .await
        .context("http server failed")?;
    Ok(())
}
