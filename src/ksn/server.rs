//! Key-share node HTTP surface
//!
//! Gated routes run behind `reveal_guard`, which buffers the body, checks the
//! commit-reveal fields and the bearer token, and records the call once the
//! handler has succeeded.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::KsnState;
use crate::commit_reveal::Credentials;
use crate::error::{ApiJson, Result, TssError};
use crate::identity::Identity;
use crate::types::{
    ApiName, ApiResponse, CheckResponse, CommitRequest, CommitResponse, HealthResponse, KeyShareV1Response,
    KeyShareV2Response, RegisterEd25519Request, RegisterRequest, RegisterResponse, ReshareRequest,
    ReshareResponse, RevealFields,
};

/// Header naming the identity provider of the bearer id_token
pub const AUTH_TYPE_HEADER: &str = "x-auth-type";

const MAX_BODY_BYTES: usize = 64 * 1024;

pub type SharedKsnState = Arc<KsnState>;

#[derive(Clone)]
struct GuardState {
    state: SharedKsnState,
    api: ApiName,
}

/// Bearer token plus auth type, if both headers are present
pub fn bearer_credentials(headers: &HeaderMap) -> Option<Credentials<'_>> {
    let id_token = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();
    let auth_type = headers.get(AUTH_TYPE_HEADER)?.to_str().ok()?.trim();
    Some(Credentials { auth_type, id_token })
}

async fn reveal_guard(State(guard): State<GuardState>, request: Request, next: Next) -> Response {
    match run_guarded(guard, request, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run_guarded(guard: GuardState, request: Request, next: Next) -> Result<Response> {
    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| TssError::InvalidRequest("unreadable request body".to_string()))?;
    let reveal: RevealFields = serde_json::from_slice(&bytes)
        .map_err(|e| TssError::InvalidRequest(format!("invalid body: {}", e)))?;

    let credentials = bearer_credentials(&parts.headers);
    let accepted = guard
        .state
        .guard
        .verify_reveal(guard.api, &reveal, credentials)
        .await?;
    let identity = match credentials {
        Some(c) => guard.state.identity.verify(c.auth_type, c.id_token)?,
        None => return Err(TssError::Unauthorized("missing bearer id_token".to_string())),
    };
    parts.extensions.insert(identity);

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    if !response.status().is_success() {
        return Ok(response);
    }

    guard.state.guard.consume(&accepted).await?;
    Ok(response)
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        role: "key-share-node".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /commit
async fn handle_commit(
    State(state): State<SharedKsnState>,
    ApiJson(request): ApiJson<CommitRequest>,
) -> Result<Json<ApiResponse<CommitResponse>>> {
    let response = state.guard.commit(&request).await?;
    Ok(Json(ApiResponse::ok(response)))
}

/// POST /check, bearer token only
async fn handle_check(State(state): State<SharedKsnState>, headers: HeaderMap) -> Result<Json<ApiResponse<CheckResponse>>> {
    let credentials = bearer_credentials(&headers)
        .ok_or_else(|| TssError::Unauthorized("missing bearer id_token".to_string()))?;
    let identity = state.identity.verify(credentials.auth_type, credentials.id_token)?;
    Ok(Json(ApiResponse::ok(state.service.check(&identity).await?)))
}

/// POST /keyshare/v1
async fn handle_keyshare_v1(
    State(state): State<SharedKsnState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ApiResponse<KeyShareV1Response>>> {
    Ok(Json(ApiResponse::ok(state.service.get_key_share_v1(&identity).await?)))
}

/// POST /keyshare/v2
async fn handle_keyshare_v2(
    State(state): State<SharedKsnState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ApiResponse<KeyShareV2Response>>> {
    Ok(Json(ApiResponse::ok(state.service.get_key_shares_v2(&identity).await?)))
}

/// POST /register
async fn handle_register(
    State(state): State<SharedKsnState>,
    Extension(identity): Extension<Identity>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> Result<Json<ApiResponse<RegisterResponse>>> {
    let response = state
        .service
        .register_secp256k1(&identity, &request.public_key, &request.share)
        .await?;
    Ok(Json(ApiResponse::ok(response)))
}

/// POST /register/ed25519
async fn handle_register_ed25519(
    State(state): State<SharedKsnState>,
    Extension(identity): Extension<Identity>,
    ApiJson(request): ApiJson<RegisterEd25519Request>,
) -> Result<Json<ApiResponse<RegisterResponse>>> {
    let response = state
        .service
        .register_ed25519(&identity, &request.public_key, &request.identifier, &request.signing_share)
        .await?;
    Ok(Json(ApiResponse::ok(response)))
}

/// POST /reshare
async fn handle_reshare(
    State(state): State<SharedKsnState>,
    Extension(identity): Extension<Identity>,
    ApiJson(request): ApiJson<ReshareRequest>,
) -> Result<Json<ApiResponse<ReshareResponse>>> {
    let response = state
        .service
        .reshare(&identity, request.secp256k1.as_ref(), request.ed25519.as_ref())
        .await?;
    Ok(Json(ApiResponse::ok(response)))
}

pub fn create_router(state: SharedKsnState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let guard_for = {
        let state = state.clone();
        move |api: ApiName| {
            middleware::from_fn_with_state(
                GuardState {
                    state: state.clone(),
                    api,
                },
                reveal_guard,
            )
        }
    };

    Router::new()
        .route("/health", get(handle_health))
        .route("/commit", post(handle_commit))
        .route("/check", post(handle_check))
        .route(
            "/keyshare/v1",
            post(handle_keyshare_v1).layer(guard_for(ApiName::GetKeyShares)),
        )
        .route(
            "/keyshare/v2",
            post(handle_keyshare_v2).layer(guard_for(ApiName::GetKeyShares)),
        )
        .route("/register", post(handle_register).layer(guard_for(ApiName::Register)))
        .route(
            "/register/ed25519",
            post(handle_register_ed25519).layer(guard_for(ApiName::Register)),
        )
        .route("/reshare", post(handle_reshare).layer(guard_for(ApiName::Reshare)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_reveal::{id_token_hash, sign_reveal};
    use crate::config::Environment;
    use crate::identity::unsigned_token;
    use crate::types::{CurveType, OperationType, SharePoint};
    use axum::http::{Request as HttpRequest, StatusCode};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const NODE: &str = "ksn-alpha";
    const SECP_PK: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn test_state() -> SharedKsnState {
        Arc::new(KsnState::in_memory(NODE, Environment::Development).unwrap())
    }

    fn token() -> String {
        unsigned_token(&json!({
            "iss": "https://accounts.google.com",
            "email": "alice@example.com",
            "exp": chrono::Utc::now().timestamp() + 600,
        }))
    }

    async fn call(app: &Router, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder
                .header("authorization", format!("Bearer {}", token))
                .header(AUTH_TYPE_HEADER, "google");
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn open(app: &Router, ephemeral: &SigningKey, operation: OperationType, token: &str) -> (String, [u8; 32]) {
        let (status, body) = call(
            app,
            "/commit",
            None,
            json!({
                "operation_type": operation,
                "client_ephemeral_pubkey": hex::encode(ephemeral.verifying_key().to_bytes()),
                "id_token_hash": id_token_hash("google", token),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let session_id = body["data"]["cr_session_id"].as_str().unwrap().to_string();
        let node_pubkey: [u8; 32] = hex::decode(body["data"]["node_pubkey"].as_str().unwrap())
            .unwrap()
            .try_into()
            .unwrap();
        (session_id, node_pubkey)
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state());
        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_then_fetch_and_replay() {
        let state = test_state();
        let app = create_router(state.clone());
        let ephemeral = SigningKey::generate(&mut OsRng);
        let token = token();

        let share = SharePoint {
            x: state.engine.share_x(CurveType::Secp256k1, NODE).unwrap(),
            y: [3; 32],
        }
        .to_hex();

        let (session_id, node_pubkey) = open(&app, &ephemeral, OperationType::SignUp, &token).await;
        let signature = sign_reveal(
            &ephemeral,
            &node_pubkey,
            &session_id,
            "google",
            &token,
            OperationType::SignUp,
            ApiName::Register,
        );
        let (status, body) = call(
            &app,
            "/register",
            Some(&token),
            json!({
                "cr_session_id": session_id,
                "cr_signature": signature,
                "public_key": SECP_PK,
                "share": share,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (session_id, node_pubkey) = open(&app, &ephemeral, OperationType::SignIn, &token).await;
        let request = json!({
            "cr_session_id": session_id,
            "cr_signature": sign_reveal(
                &ephemeral,
                &node_pubkey,
                &session_id,
                "google",
                &token,
                OperationType::SignIn,
                ApiName::GetKeyShares,
            ),
        });
        let (status, body) = call(&app, "/keyshare/v1", Some(&token), request.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["share"], share);

        // sign_in is finished after one fetch
        let (status, body) = call(&app, "/keyshare/v1", Some(&token), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_SESSION_STATE");
    }

    #[tokio::test]
    async fn test_failed_handler_does_not_consume() {
        let state = test_state();
        let app = create_router(state);
        let ephemeral = SigningKey::generate(&mut OsRng);
        let token = token();

        let (session_id, node_pubkey) = open(&app, &ephemeral, OperationType::SignIn, &token).await;
        let request = json!({
            "cr_session_id": session_id,
            "cr_signature": sign_reveal(
                &ephemeral,
                &node_pubkey,
                &session_id,
                "google",
                &token,
                OperationType::SignIn,
                ApiName::GetKeyShares,
            ),
        });

        let (status, body) = call(&app, "/keyshare/v2", Some(&token), request.clone()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "USER_NOT_FOUND");

        // the reveal was not recorded, so the same call is judged again
        let (_, body) = call(&app, "/keyshare/v2", Some(&token), request).await;
        assert_eq!(body["code"], "USER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_guard_requires_reveal_and_token() {
        let app = create_router(test_state());

        let (status, body) = call(&app, "/keyshare/v2", Some(&token()), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let (status, body) = call(
            &app,
            "/keyshare/v2",
            None,
            json!({"cr_session_id": "x", "cr_signature": "y"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_envelope() {
        let app = create_router(test_state());
        let (status, body) = call(&app, "/commit", None, json!({"operation_type": "sign_up"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "INVALID_REQUEST");

        // reveal fields pass the guard, the register payload is missing
        let ephemeral = SigningKey::generate(&mut OsRng);
        let token = token();
        let (session_id, node_pubkey) = open(&app, &ephemeral, OperationType::SignUp, &token).await;
        let request = json!({
            "cr_session_id": session_id,
            "cr_signature": sign_reveal(
                &ephemeral,
                &node_pubkey,
                &session_id,
                "google",
                &token,
                OperationType::SignUp,
                ApiName::Register,
            ),
        });
        let (status, body) = call(&app, "/register", Some(&token), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_check_needs_only_bearer() {
        let app = create_router(test_state());
        let (status, body) = call(&app, "/check", Some(&token()), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["secp256k1"], "NOT_REGISTERED");

        let (status, _) = call(&app, "/check", None, json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
