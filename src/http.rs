//! Read-only status endpoint.

use std::future::Future;

use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::SimResult;
use crate::simulator::StatusSnapshot;

type StatusRx = watch::Receiver<StatusSnapshot>;

pub fn router(status: StatusRx) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(health))
        .layer(cors)
        .with_state(status)
}

pub async fn serve<F>(listener: TcpListener, status: StatusRx, shutdown: F) -> SimResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Status endpoint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(status))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn get_status(State(status): State<StatusRx>) -> Json<StatusSnapshot> {
    Json(status.borrow().clone())
}

async fn health() -> &'static str {
    "ok"
}
