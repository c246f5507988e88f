//! Entry point for the `virtbridge-gateway` HTTP server.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use virtbridge_gateway::routes::create_router;
use virtbridge_host::{Bridge, BridgeConfig, LibvirtBackend};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let addr = config.listen_addr.clone();

    let bridge = match Bridge::new(LibvirtBackend::new(), config) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to create bridge");
            std::process::exit(2);
        }
    };
    let app = create_router(Arc::new(bridge));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "virtbridge-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
