use crate::{data_health, handlers, websocket};
use axum::{
    routing::{get, post},
    Router,
};
use options_guard_manager::EngineApi;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct ApiServer {
    api: EngineApi,
}

impl ApiServer {
    #[must_use]
    pub const fn new(api: EngineApi) -> Self {
        Self { api }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route(
                "/api/users/:user_id/positions",
                get(handlers::list_positions).post(handlers::add_position),
            )
            .route("/api/users/:user_id/plans", get(handlers::pending_plans))
            .route("/api/users/:user_id/portfolio", get(handlers::portfolio_greeks))
            .route("/api/users/:user_id/alerts", get(handlers::alert_log))
            .route(
                "/api/users/:user_id/account",
                get(handlers::get_account).put(handlers::put_account),
            )
            .route("/api/users/:user_id/entries", post(handlers::recommend_entry))
            .route("/api/positions/:id", get(handlers::get_position))
            .route("/api/positions/:id/health", get(handlers::health_history))
            .route("/api/positions/:id/recheck", post(handlers::recheck))
            .route("/api/plans/:id", get(handlers::get_plan))
            .route("/api/plans/:id/accept", post(handlers::accept_plan))
            .route("/api/plans/:id/reject", post(handlers::reject_plan))
            .route("/api/regime", get(handlers::regime))
            .route("/api/data/health", get(data_health::data_health))
            .route("/ws", get(websocket::websocket_handler))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.api.clone())
    }

    /// Starts the web server listening on the specified address.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address or serve requests.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web API listening on {}", addr);

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
