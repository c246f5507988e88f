//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use virtbridge_core::{BridgeError, ConnectionId};

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the bridge.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The requested connection ID is not registered.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The request body or path is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) | GatewayError::Bridge(BridgeError::BadArgument(_)) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Bridge(BridgeError::ClosedConnection) => StatusCode::GONE,
            GatewayError::Bridge(BridgeError::Allocation { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Bridge(BridgeError::Connection { .. } | BridgeError::Query { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Bridge(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::Bridge(e) => e.kind(),
            GatewayError::ConnectionNotFound(_) => "not_found",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }

    fn source_detail(&self) -> Option<&str> {
        match self {
            GatewayError::Bridge(e) => e.detail(),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, detail = ?self.source_detail(), "request failed");
        }
        (status, Json(json!({"error": self.to_string(), "kind": self.kind()}))).into_response()
    }
}
