pub mod handlers;
pub mod hdhr;
pub mod lineup;
pub mod m3u_out;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod xmltv;

use std::net::SocketAddr;

pub use state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),

    #[error("server runtime error: {0}")]
    Runtime(String),
}

/// Serve the tuner surface until the process shuts down.
///
/// Binds all interfaces: Plex discovers and consumes the tuner over the LAN.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.listen_port;
    let app = routes::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "tuner http server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::Runtime(e.to_string()))?;

    Ok(())
}
