pub mod api;
pub mod sse;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use keepalive_core::KeepaliveConfig;
use keepalive_core::broker::VerificationBroker;
use keepalive_core::login::LoginManager;
use keepalive_core::notify::Notifier;
use keepalive_core::scheduler::Scheduler;
use keepalive_core::store::TaskStore;
use keepalive_core::upstream::AccountClient;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

/// Services shared by every request handler.
pub struct AppState {
    pub logins: Arc<LoginManager>,
    pub scheduler: Arc<Scheduler>,
    pub broker: VerificationBroker,
    /// Username of the notification bot, shown to users when they pick a
    /// notification target.
    pub bot_name: Option<String>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Load persisted tasks, start their schedules and the login sweeper.
    pub async fn start(
        client: Arc<dyn AccountClient>,
        notifier: Arc<dyn Notifier>,
        data_dir: &Path,
        config: &KeepaliveConfig,
        bot_name: Option<String>,
    ) -> Result<Arc<Self>> {
        config.validate().context("invalid keepalive configuration")?;
        let (store, report) = TaskStore::open(data_dir)
            .with_context(|| format!("failed to open task store {}", data_dir.display()))?;

        let scheduler = Scheduler::new(Arc::new(store), client.clone(), notifier, config);
        scheduler.start(report).await;

        let shutdown = CancellationToken::new();
        let logins = Arc::new(LoginManager::new(client.clone(), config.login_ttl));
        logins.spawn_sweeper(config.login_sweep_interval, shutdown.clone());

        let broker = VerificationBroker::new(client, config);
        info!(
            tasks = scheduler.scheduled(),
            subscription_capacity = broker.capacity(),
            "keepalive services started"
        );

        Ok(Arc::new(Self {
            logins,
            scheduler,
            broker,
            bot_name,
            shutdown,
        }))
    }

    /// Stop schedules, end open subscriptions and release pending logins.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();
        self.broker.shutdown();
        self.logins.shutdown().await;
        info!("keepalive services stopped");
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/login/start", post(api::login_start))
        .route("/api/login/code", post(api::login_code))
        .route("/api/login/password", post(api::login_password))
        .route("/api/task/validate", post(api::task_validate))
        .route("/api/task/create", post(api::task_create))
        .route(
            "/api/task/{uuid}",
            get(api::task_get).delete(api::task_delete),
        )
        .route("/api/task/{uuid}/heartbeat", post(api::task_heartbeat))
        .route("/api/verify/listen", get(sse::verify_listen))
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_accepts_wildcard_and_lists() {
        assert!(build_cors(&["*".to_string()]).is_ok());
        assert!(build_cors(&["http://localhost:3000".to_string()]).is_ok());
        assert!(build_cors(&["bad\norigin".to_string()]).is_err());
    }
}
