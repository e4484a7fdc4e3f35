//! Portal-facing HTTP API
//!
//! The captive-portal UI is the only caller. Every response is definitive:
//! a session with its expiry, or a typed failure - never a "maybe".

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use meshlink_broker::Broker;
use meshlink_common::{BrokerError, ClientAddr, Session};

/// Shared API state
#[derive(Clone)]
pub struct AppState {
    /// The authorization broker
    pub broker: Arc<Broker>,
    /// Subnets clients may authorize from; empty = unrestricted
    pub subnets: Arc<Vec<IpNetwork>>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/tiers", get(tiers))
        .route("/api/v1/authorize", post(authorize))
        .route("/api/v1/sessions/:ip", get(get_session).delete(disconnect))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AuthorizeRequest {
    client_ip: String,
    mac: Option<String>,
    tier: String,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: Uuid,
    client_ip: String,
    tier: String,
    expires_at: DateTime<Utc>,
    data_used_bytes: u64,
    status: String,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            client_ip: s.client_addr.to_string(),
            tier: s.tier,
            expires_at: s.expires_at,
            data_used_bytes: s.data_used_bytes,
            status: format!("{:?}", s.status).to_lowercase(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    detail: String,
}

fn error_response(kind: &str, detail: impl Into<String>, code: StatusCode) -> (StatusCode, Json<ApiError>) {
    (
        code,
        Json(ApiError {
            error: kind.into(),
            detail: detail.into(),
        }),
    )
}

fn map_broker_error(err: BrokerError) -> (StatusCode, Json<ApiError>) {
    let (kind, code) = match &err {
        BrokerError::UnknownTier(_) => ("unknown_tier", StatusCode::NOT_FOUND),
        BrokerError::Conflict(_) => ("conflict", StatusCode::CONFLICT),
        BrokerError::EnforcementFailure(_) => ("enforcement_failure", StatusCode::BAD_GATEWAY),
        BrokerError::NotFound(_) => ("not_found", StatusCode::NOT_FOUND),
        BrokerError::InvalidState { .. } => ("invalid_state", StatusCode::CONFLICT),
        BrokerError::Storage(_) => ("storage", StatusCode::INTERNAL_SERVER_ERROR),
    };
    error_response(kind, err.to_string(), code)
}

fn parse_client_ip(raw: &str) -> Result<ClientAddr, (StatusCode, Json<ApiError>)> {
    raw.parse().map_err(|_| {
        error_response(
            "bad_address",
            format!("not an IP address: {raw}"),
            StatusCode::BAD_REQUEST,
        )
    })
}

async fn authorize(
    State(state): State<AppState>,
    Json(req): Json<AuthorizeRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), (StatusCode, Json<ApiError>)> {
    let addr = parse_client_ip(&req.client_ip)?;

    if !state.subnets.is_empty() && !state.subnets.iter().any(|n| n.contains(addr.ip())) {
        return Err(error_response(
            "address_not_allowed",
            format!("{addr} is outside the client subnets"),
            StatusCode::FORBIDDEN,
        ));
    }

    let session = state
        .broker
        .authorize(addr, req.mac, &req.tier)
        .await
        .map_err(map_broker_error)?;

    Ok((StatusCode::CREATED, Json(session.into())))
}

async fn get_session(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<SessionResponse>, (StatusCode, Json<ApiError>)> {
    let addr = parse_client_ip(&ip)?;
    state
        .broker
        .session_for(addr)
        .map(|s| Json(s.into()))
        .ok_or_else(|| {
            error_response(
                "not_found",
                format!("no active session for {addr}"),
                StatusCode::NOT_FOUND,
            )
        })
}

async fn disconnect(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let addr = parse_client_ip(&ip)?;
    match state.broker.disconnect(addr).await.map_err(map_broker_error)? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(error_response(
            "not_found",
            format!("no session for {addr}"),
            StatusCode::NOT_FOUND,
        )),
    }
}

#[derive(Debug, Serialize)]
struct TierResponse {
    name: String,
    duration_secs: u64,
    down_kbps: u32,
    up_kbps: u32,
    data_quota_bytes: u64,
    price_cents: u32,
}

async fn tiers(State(state): State<AppState>) -> Json<Vec<TierResponse>> {
    Json(
        state
            .broker
            .tier_catalog()
            .all()
            .iter()
            .map(|t| TierResponse {
                name: t.name.clone(),
                duration_secs: t.duration_secs,
                down_kbps: t.down_kbps,
                up_kbps: t.up_kbps,
                data_quota_bytes: t.data_quota_bytes,
                price_cents: t.price_cents,
            })
            .collect(),
    )
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    active_sessions: usize,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").into(),
        active_sessions: state.broker.active_sessions().len(),
    })
}

async fn health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use meshlink_broker::{ExpiryScheduler, MemoryGateway, SessionStore};
    use meshlink_common::TierCatalog;
    use tower::util::ServiceExt;

    fn test_router() -> Router {
        let path = std::env::temp_dir().join(format!("meshlink-api-{}.json", Uuid::new_v4()));
        let store = Arc::new(SessionStore::open(path).unwrap());
        let gw: Arc<dyn meshlink_broker::EnforcementGateway> = Arc::new(MemoryGateway::new());
        let scheduler = Arc::new(ExpiryScheduler::new(store.clone(), gw.clone()));
        let broker = Arc::new(Broker::new(store, gw, scheduler, TierCatalog::default()));
        router(AppState {
            broker,
            subnets: Arc::new(vec!["10.0.0.0/24".parse().unwrap()]),
        })
    }

    fn authorize_req(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/authorize")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_authorize_returns_session() {
        let app = test_router();
        let res = app
            .oneshot(authorize_req(
                r#"{"client_ip": "10.0.0.5", "tier": "free"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["tier"], "free");
        assert_eq!(json["status"], "active");
        assert!(json["session_id"].is_string());
        assert!(json["expires_at"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_tier_is_404() {
        let app = test_router();
        let res = app
            .oneshot(authorize_req(
                r#"{"client_ip": "10.0.0.5", "tier": "platinum"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "unknown_tier");
    }

    #[tokio::test]
    async fn test_bad_address_is_400() {
        let app = test_router();
        let res = app
            .oneshot(authorize_req(r#"{"client_ip": "portal", "tier": "free"}"#))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_outside_subnet_is_403() {
        let app = test_router();
        let res = app
            .oneshot(authorize_req(
                r#"{"client_ip": "192.168.99.1", "tier": "free"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_session_lookup_and_disconnect() {
        let app = test_router();

        app.clone()
            .oneshot(authorize_req(
                r#"{"client_ip": "10.0.0.5", "tier": "free"}"#,
            ))
            .await
            .unwrap();

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions/10.0.0.5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/sessions/10.0.0.5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions/10.0.0.5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tiers_listing() {
        let app = test_router();
        let res = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/tiers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["free", "lightweight", "premium"]);
    }
}
