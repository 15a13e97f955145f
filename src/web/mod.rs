//! Web server module: router, shared state, and the auth gate.

mod handlers;

pub use handlers::*;

use crate::analytics::Analytics;
use crate::auth;
use crate::config::AppConfig;
use crate::db::Store;
use crate::registry::Registry;
use crate::scheduler::Scheduler;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header::AUTHORIZATION, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, patch, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<Registry>,
    pub analytics: Analytics,
}

/// Bearer-token gate for every route except login.
async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::Unauthenticated)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthenticated)?;
    let claims = auth::verify_token(&state.config.auth_secret, token)
        .map_err(|_| ApiError::Unauthenticated)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

fn cors_layer(origins: &str) -> CorsLayer {
    if origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let list: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(list)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// API server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        registry: Arc<Registry>,
        analytics: Analytics,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
                registry,
                analytics,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let protected = Router::new()
            .route(
                "/targets/",
                post(handlers::handle_create_target).get(handlers::handle_list_targets),
            )
            .route(
                "/targets/{id}",
                patch(handlers::handle_update_target).delete(handlers::handle_delete_target),
            )
            .route("/targets/{id}/pause", post(handlers::handle_pause_target))
            .route("/targets/{id}/resume", post(handlers::handle_resume_target))
            .route("/targets/{id}/logs", get(handlers::handle_logs))
            .route("/targets/{id}/logs/export", get(handlers::handle_export_logs))
            .route("/targets/{id}/events", get(handlers::handle_events))
            .route("/targets/{id}/insights", get(handlers::handle_insights))
            .route("/targets/{id}/traceroute", post(handlers::handle_traceroute))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_auth,
            ));

        Router::new()
            .route("/auth/login", post(handlers::handle_login))
            .merge(protected)
            .layer(cors_layer(&self.state.config.cors_origins))
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown future resolves, then drain.
    pub async fn start<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.app_port));
        let router = self.routes();

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
