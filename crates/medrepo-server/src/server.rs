use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::bootstrap::{Services, build_services};
use crate::config::{AppConfig, SearchSettings};
use crate::{admin, handlers};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub search: SearchSettings,
}

pub fn build_app(cfg: &AppConfig, services: Services) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    let state = AppState {
        services,
        search: cfg.search.clone(),
    };
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/fhir/{resource_type}",
            get(handlers::search_resource).post(handlers::create_resource),
        )
        .route(
            "/fhir/{resource_type}/{id}",
            get(handlers::read_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource)
                .post(handlers::type_operation),
        )
        .route(
            "/fhir/{resource_type}/{id}/{operation}",
            get(handlers::instance_operation),
        )
        .route(
            "/fhir/{resource_type}/{id}/{operation}/{version_id}",
            get(handlers::read_version),
        )
        .merge(admin::admin_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        tenant = req
                            .headers()
                            .get(handlers::TENANT_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or(""),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct MedrepoServer {
    addr: SocketAddr,
    app: Router,
    services: Services,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Opens storage, activates shards and starts the dispatcher.
    pub async fn build(self) -> anyhow::Result<MedrepoServer> {
        let services = build_services(&self.config, CancellationToken::new()).await?;
        let app = build_app(&self.config, services.clone());
        Ok(MedrepoServer {
            addr: self.addr,
            app,
            services,
        })
    }
}

impl MedrepoServer {
    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let services = self.services.clone();
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal(services))
            .await?;
        Ok(())
    }
}

/// Waits for Ctrl+C, then stops migrations between steps and closes every
/// subscription session so their sockets drain.
async fn shutdown_signal(services: Services) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    services.shutdown.cancel();
    services.dispatcher.shutdown();
}
