//! HTTP control plane for attractor pipeline runs.
//!
//! JSON over one TCP endpoint: submit a pipeline, watch its event stream
//! over SSE, answer human-gate questions, cancel, and fetch checkpoint /
//! context / graph snapshots. One in-memory registry per process; runs do
//! not survive a restart.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, RunHandle};

use std::net::SocketAddr;

pub async fn serve(addr: SocketAddr) -> Result<(), std::io::Error> {
    let state = AppState::new();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "control plane listening");
    axum::serve(listener, app).await
}
