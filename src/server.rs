//! TSS API server
//!
//! Thin axum layer over `StageMachine`: every handler deserializes the body,
//! runs one round and wraps the result in the response envelope.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::crypto::{CryptoEngine, SoftwareEngine};
use crate::error::{ApiJson, Result};
use crate::stage::triples::{FIRST_STEP, LAST_STEP};
use crate::stage::StageMachine;
use crate::storage::{SqliteTssStore, StorageError, TssStore};
use crate::types::{
    ApiResponse, EcdsaAggregateRequest, EcdsaAggregateResponse, EcdsaRound1Request, EcdsaRound1Response,
    EcdsaRound2Request, EcdsaRound2Response, EddsaAggregateRequest, EddsaAggregateResponse, EddsaRound1Request,
    EddsaRound1Response, EddsaRound2Request, EddsaRound2Response, HealthResponse, KeygenRequest,
    KeygenResponse, KeygenV2Request, TriplesRequest, TriplesResponse,
};

/// Application state for the TSS API
pub struct AppState {
    pub machine: StageMachine,
}

/// Shared application state type
pub type SharedAppState = Arc<AppState>;

impl AppState {
    pub fn new(
        store: Arc<dyn TssStore>,
        engine: Arc<dyn CryptoEngine>,
        share_password: impl Into<String>,
        sss_threshold: u16,
    ) -> SharedAppState {
        Arc::new(Self {
            machine: StageMachine::new(store, engine, share_password, sss_threshold),
        })
    }

    /// In-memory state on the software engine
    pub fn in_memory(share_password: &str) -> std::result::Result<SharedAppState, StorageError> {
        Ok(Self::new(
            Arc::new(SqliteTssStore::in_memory()?),
            Arc::new(SoftwareEngine::new()),
            share_password,
            2,
        ))
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>>;

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        role: "tss-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /keygen
async fn handle_keygen(State(state): State<SharedAppState>, ApiJson(request): ApiJson<KeygenRequest>) -> ApiResult<KeygenResponse> {
    Ok(Json(ApiResponse::ok(state.machine.keygen(&request).await?)))
}

/// POST /keygen/v2
async fn handle_keygen_v2(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<KeygenV2Request>,
) -> ApiResult<KeygenResponse> {
    Ok(Json(ApiResponse::ok(state.machine.keygen_v2(&request).await?)))
}

/// POST /triples/step{1..=11}
async fn handle_triples(state: SharedAppState, step: u8, request: TriplesRequest) -> ApiResult<TriplesResponse> {
    Ok(Json(ApiResponse::ok(state.machine.triples_step(step, &request).await?)))
}

async fn handle_ecdsa_round1(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<EcdsaRound1Request>,
) -> ApiResult<EcdsaRound1Response> {
    Ok(Json(ApiResponse::ok(state.machine.ecdsa_round1(&request).await?)))
}

async fn handle_ecdsa_round2(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<EcdsaRound2Request>,
) -> ApiResult<EcdsaRound2Response> {
    Ok(Json(ApiResponse::ok(state.machine.ecdsa_round2(&request).await?)))
}

async fn handle_ecdsa_aggregate(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<EcdsaAggregateRequest>,
) -> ApiResult<EcdsaAggregateResponse> {
    Ok(Json(ApiResponse::ok(state.machine.ecdsa_aggregate(&request).await?)))
}

async fn handle_eddsa_round1(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<EddsaRound1Request>,
) -> ApiResult<EddsaRound1Response> {
    Ok(Json(ApiResponse::ok(state.machine.eddsa_round1(&request).await?)))
}

async fn handle_eddsa_round2(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<EddsaRound2Request>,
) -> ApiResult<EddsaRound2Response> {
    Ok(Json(ApiResponse::ok(state.machine.eddsa_round2(&request).await?)))
}

async fn handle_eddsa_aggregate(
    State(state): State<SharedAppState>,
    ApiJson(request): ApiJson<EddsaAggregateRequest>,
) -> ApiResult<EddsaAggregateResponse> {
    Ok(Json(ApiResponse::ok(state.machine.eddsa_aggregate(&request).await?)))
}

/// Create the router with all endpoints
pub fn create_router(state: SharedAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(handle_health))
        .route("/keygen", post(handle_keygen))
        .route("/keygen/v2", post(handle_keygen_v2))
        .route("/sign_secp256k1/round1", post(handle_ecdsa_round1))
        .route("/sign_secp256k1/round2", post(handle_ecdsa_round2))
        .route("/sign_secp256k1/aggregate", post(handle_ecdsa_aggregate))
        .route("/sign_ed25519/round1", post(handle_eddsa_round1))
        .route("/sign_ed25519/round2", post(handle_eddsa_round2))
        .route("/sign_ed25519/aggregate", post(handle_eddsa_aggregate));

    for step in FIRST_STEP..=LAST_STEP {
        router = router.route(
            &format!("/triples/step{}", step),
            post(
                move |State(state): State<SharedAppState>, ApiJson(request): ApiJson<TriplesRequest>| async move {
                    handle_triples(state, step, request).await
                },
            ),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::secp_payload;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        create_router(AppState::in_memory("test-password").unwrap())
    }

    async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["role"], "tss-server");
    }

    #[tokio::test]
    async fn test_keygen_then_triples_step1() {
        let app = app();
        let (payload, _) = secp_payload();
        let mut body = serde_json::to_value(&payload).unwrap();
        body["email"] = json!("alice@example.com");

        let (status, keygen) = post_json(&app, "/keygen", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(keygen["success"], true);
        let wallet_id = keygen["data"]["wallets"][0]["wallet_id"].clone();

        let (status, duplicate) = post_json(&app, "/keygen", body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(duplicate["success"], false);
        assert_eq!(duplicate["code"], "WALLET_ALREADY_EXISTS");

        let (status, step1) = post_json(
            &app,
            "/triples/step1",
            json!({"email": "alice@example.com", "wallet_id": wallet_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(step1["data"]["status"], "STEP_1");
        assert_eq!(step1["data"]["message"]["kind"], "commit");
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_envelope() {
        let app = app();
        let (status, body) = post_json(&app, "/keygen", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triples/step1")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_user_and_step() {
        let app = app();
        let (status, body) = post_json(
            &app,
            "/sign_ed25519/round1",
            json!({
                "email": "nobody@example.com",
                "wallet_id": uuid::Uuid::new_v4(),
                "message": "00",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "USER_NOT_FOUND");

        let (status, _) = post_json(&app, "/triples/step12", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
