//! Axum route handlers for the virtbridge gateway API.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use virtbridge_core::{ConnectionId, ToTerm};
use virtbridge_host::HostApi;

use crate::error::GatewayError;

// ── Shared state ─────────────────────────────────────────────────────────────

type Api = Arc<dyn HostApi>;

// ── Request types ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ConnectBody {
    /// Hypervisor URI; the bridge default is used when absent.
    #[serde(default)]
    pub uri: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router over the given host API.
pub fn create_router(api: Api) -> Router {
    Router::new()
        .route("/v1/connections", post(connect))
        .route("/v1/connections/{id}", get(describe_connection).delete(disconnect))
        .route("/v1/connections/{id}/domains", get(list_domains))
        .route("/v1/connections/{id}/host", get(host_info))
        .route("/v1/connections/{id}/node", get(node_info))
        .route("/health", get(health))
        .with_state(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `POST /v1/connections`: open a hypervisor connection.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] for an unparseable body and
/// [`GatewayError::Bridge`] if the URI is malformed or the host cannot be
/// reached.
pub async fn connect(
    State(api): State<Api>,
    body: Result<Json<ConnectBody>, JsonRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let Json(body) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let info = api.connect(body.uri.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /v1/connections/:id`: describe a connection.
///
/// # Errors
/// Returns [`GatewayError::ConnectionNotFound`] if the ID is not registered.
pub async fn describe_connection(
    State(api): State<Api>,
    id: Result<Path<ConnectionId>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = connection_id(id)?;
    api.describe(id).map(Json).ok_or(GatewayError::ConnectionNotFound(id))
}

/// `DELETE /v1/connections/:id`: close and forget a connection.
///
/// Idempotent: deleting an unknown or already deleted ID also answers 204,
/// including when two deletes of the same ID race.
///
/// # Errors
/// Returns [`GatewayError::InvalidRequest`] for a malformed ID.
pub async fn disconnect(
    State(api): State<Api>,
    id: Result<Path<ConnectionId>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = connection_id(id)?;
    api.disconnect(id).await?;
    api.release(id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/connections/:id/domains`: list active domains.
///
/// Domains that vanish while the list is built appear as `null`.
///
/// # Errors
/// Returns [`GatewayError::ConnectionNotFound`] for unknown IDs and
/// [`GatewayError::Bridge`] if the host query fails.
pub async fn list_domains(
    State(api): State<Api>,
    id: Result<Path<ConnectionId>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = connection_id(id)?;
    ensure_registered(&api, id)?;
    let domains = api.list_domains(id).await?;
    Ok(Json(domains.to_term()))
}

/// `GET /v1/connections/:id/host`: per-CPU time counters.
///
/// # Errors
/// Returns [`GatewayError::ConnectionNotFound`] for unknown IDs and
/// [`GatewayError::Bridge`] if any CPU's stats query fails.
pub async fn host_info(
    State(api): State<Api>,
    id: Result<Path<ConnectionId>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = connection_id(id)?;
    ensure_registered(&api, id)?;
    let info = api.get_host_info(id).await?;
    Ok(Json(info.to_term()))
}

/// `GET /v1/connections/:id/node`: host hardware summary.
///
/// # Errors
/// Returns [`GatewayError::ConnectionNotFound`] for unknown IDs and
/// [`GatewayError::Bridge`] if the node info query fails.
pub async fn node_info(
    State(api): State<Api>,
    id: Result<Path<ConnectionId>, PathRejection>,
) -> Result<impl IntoResponse, GatewayError> {
    let id = connection_id(id)?;
    ensure_registered(&api, id)?;
    let node = api.get_node_info(id).await?;
    Ok(Json(node.to_term()))
}

fn connection_id(path: Result<Path<ConnectionId>, PathRejection>) -> Result<ConnectionId, GatewayError> {
    path.map(|Path(id)| id)
        .map_err(|e| GatewayError::InvalidRequest(e.body_text()))
}

fn ensure_registered(api: &Api, id: ConnectionId) -> Result<(), GatewayError> {
    if api.describe(id).is_none() {
        return Err(GatewayError::ConnectionNotFound(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use virtbridge_host::mock::{MockDomain, MockFailures, MockHost};
    use virtbridge_host::{Bridge, BridgeConfig, MockBackend};

    fn test_api(host: MockHost) -> Api {
        let config = BridgeConfig::default().with_default_uri("mock:///default");
        match Bridge::new(MockBackend::new(host), config) {
            Ok(b) => Arc::new(b) as Api,
            Err(e) => panic!("bridge construction failed: {e}"),
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = match builder.body(body.map_or_else(Body::empty, |b| Body::from(b.to_owned()))) {
            Ok(r) => r,
            Err(e) => panic!("failed to build request: {e}"),
        };
        let resp = match app.clone().oneshot(req).await {
            Ok(r) => r,
            Err(e) => panic!("handler error: {e}"),
        };
        let status = resp.status();
        let bytes = match axum::body::to_bytes(resp.into_body(), 64 * 1024).await {
            Ok(b) => b,
            Err(e) => panic!("failed to read body: {e}"),
        };
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(e) => panic!("invalid JSON: {e}"),
            }
        };
        (status, json)
    }

    async fn open(app: &Router) -> String {
        let (status, body) = send(app, Method::POST, "/v1/connections", Some("{}")).await;
        assert_eq!(status, StatusCode::CREATED, "connect failed: {body}");
        match body["id"].as_str() {
            Some(id) => id.to_owned(),
            None => panic!("connect response has no id: {body}"),
        }
    }

    #[tokio::test]
    async fn health_response_format_returns_ok_with_status_field() {
        let app = create_router(test_api(MockHost::new()));
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn connect_with_unreachable_uri_returns_bad_gateway() {
        let app = create_router(test_api(MockHost::new()));
        let (status, body) =
            send(&app, Method::POST, "/v1/connections", Some(r#"{"uri":"qemu:///system"}"#)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "failed to connect to hypervisor");
        assert_eq!(body["kind"], "connection_error");
    }

    #[tokio::test]
    async fn list_domains_returns_null_for_vanished_domain() {
        let host = MockHost::new()
            .with_domain(MockDomain::running(1, "web-01"))
            .with_domain(MockDomain::running(2, "gone").vanished());
        let app = create_router(test_api(host));
        let id = open(&app).await;

        let (status, body) = send(&app, Method::GET, &format!("/v1/connections/{id}/domains"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "web-01");
        assert_eq!(body[0]["state"], 1);
        assert!(body[1].is_null(), "vanished domain must serialize as null");
    }

    #[tokio::test]
    async fn host_info_returns_per_cpu_time() {
        let app = create_router(test_api(MockHost::demo()));
        let id = open(&app).await;

        let (status, body) = send(&app, Method::GET, &format!("/v1/connections/{id}/host"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cpus"], 2);
        assert_eq!(body["time"][0]["total"], 10_000);
        assert_eq!(body["time"][1]["idle"], 8_000);
    }

    #[tokio::test]
    async fn host_info_cpu_failure_returns_bad_gateway() {
        let failures = MockFailures { cpu_fetch: Some(1), ..Default::default() };
        let app = create_router(test_api(MockHost::demo().with_failures(failures)));
        let id = open(&app).await;

        let (status, body) = send(&app, Method::GET, &format!("/v1/connections/{id}/host"), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "failed to get cpu stats");
    }

    #[tokio::test]
    async fn node_info_returns_hardware_summary() {
        let app = create_router(test_api(MockHost::demo()));
        let id = open(&app).await;

        let (status, body) = send(&app, Method::GET, &format!("/v1/connections/{id}/node"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cpus"], 2);
        assert_eq!(body["mhz"], 2400);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_forgets_connection() {
        let app = create_router(test_api(MockHost::demo()));
        let id = open(&app).await;
        let path = format!("/v1/connections/{id}");

        let (first, _) = send(&app, Method::DELETE, &path, None).await;
        let (second, _) = send(&app, Method::DELETE, &path, None).await;
        assert_eq!(first, StatusCode::NO_CONTENT);
        assert_eq!(second, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, Method::GET, &format!("{path}/domains"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn describe_connection_reports_uri() {
        let app = create_router(test_api(MockHost::new()));
        let id = open(&app).await;
        let (status, body) = send(&app, Method::GET, &format!("/v1/connections/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uri"], "mock:///default");
        assert_eq!(body["closed"], false);
    }

    #[tokio::test]
    async fn connect_with_malformed_body_returns_bad_request() {
        let app = create_router(test_api(MockHost::new()));
        let (status, body) = send(&app, Method::POST, "/v1/connections", Some(r#"{"uri": 7}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn malformed_connection_id_is_rejected_with_json_error() {
        let app = create_router(test_api(MockHost::new()));
        for (method, path) in [
            (Method::GET, "/v1/connections/not-a-uuid"),
            (Method::DELETE, "/v1/connections/not-a-uuid"),
            (Method::GET, "/v1/connections/not-a-uuid/domains"),
            (Method::GET, "/v1/connections/not-a-uuid/host"),
            (Method::GET, "/v1/connections/not-a-uuid/node"),
        ] {
            let (status, body) = send(&app, method.clone(), path, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{method} {path}");
            assert_eq!(body["kind"], "invalid_request", "{method} {path}");
        }
    }

    #[tokio::test]
    async fn concurrent_deletes_of_one_connection_both_answer_no_content() {
        let app = create_router(test_api(MockHost::demo()));
        let id = open(&app).await;
        let path = format!("/v1/connections/{id}");

        let (first, second) = tokio::join!(
            send(&app, Method::DELETE, &path, None),
            send(&app, Method::DELETE, &path, None)
        );
        assert_eq!(first.0, StatusCode::NO_CONTENT);
        assert_eq!(second.0, StatusCode::NO_CONTENT);
    }
}
