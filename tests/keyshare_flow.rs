//! Sign-up, sign-in and reshare against live key-share nodes on loopback

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use tss_server::commit_reveal::{id_token_hash, sign_reveal};
use tss_server::config::Environment;
use tss_server::identity::unsigned_token;
use tss_server::ksn::{self, KsnState, AUTH_TYPE_HEADER};
use tss_server::types::{ApiName, CurveType, KeyShareNodeMeta, NodeSet, NodeWalletStatus, OperationType};
use tss_server::{KeyShareNodeClient, SoftwareEngine, UserCredentials};

const AUTH_TYPE: &str = "google";
const SECP_PK: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
const SECRET: [u8; 32] = [7; 32];

async fn spawn_node(name: &str) -> KeyShareNodeMeta {
    let state = Arc::new(KsnState::in_memory(name, Environment::Development).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, ksn::create_router(state)).await.unwrap();
    });

    KeyShareNodeMeta {
        node_id: name.to_string(),
        name: name.to_string(),
        endpoint: format!("http://{}", addr),
        wallet_status: NodeWalletStatus::NotRegistered,
    }
}

fn with_status(nodes: &[KeyShareNodeMeta], status: NodeWalletStatus) -> Vec<KeyShareNodeMeta> {
    nodes
        .iter()
        .map(|n| KeyShareNodeMeta {
            wallet_status: status,
            ..n.clone()
        })
        .collect()
}

fn client(nodes: Vec<KeyShareNodeMeta>) -> KeyShareNodeClient {
    KeyShareNodeClient::new(
        NodeSet { nodes, threshold: 2 },
        Arc::new(SoftwareEngine::new()),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn credentials(email: &str) -> UserCredentials {
    UserCredentials {
        auth_type: AUTH_TYPE.to_string(),
        id_token: unsigned_token(&json!({
            "iss": "https://accounts.google.com",
            "email": email,
            "exp": chrono::Utc::now().timestamp() + 600,
        })),
    }
}

fn ed25519_public_key() -> String {
    hex::encode(SigningKey::from_bytes(&[1; 32]).verifying_key().to_bytes())
}

/// Register both curves on `nodes` for `creds`
async fn sign_up(nodes: &[KeyShareNodeMeta], creds: &UserCredentials) {
    let client = client(nodes.to_vec());
    client.register_key_shares(creds, SECP_PK, &SECRET).await.unwrap();
    client
        .register_teddsa_shares(creds, &ed25519_public_key(), &SECRET)
        .await
        .unwrap();
}

async fn post(
    http: &reqwest::Client,
    node: &KeyShareNodeMeta,
    path: &str,
    creds: Option<&UserCredentials>,
    body: Value,
) -> (StatusCode, Value) {
    let mut request = http.post(format!("{}{}", node.endpoint, path)).json(&body);
    if let Some(creds) = creds {
        request = request
            .bearer_auth(&creds.id_token)
            .header(AUTH_TYPE_HEADER, &creds.auth_type);
    }
    let response = request.send().await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

struct RawSession {
    ephemeral: SigningKey,
    session_id: String,
    node_pubkey: [u8; 32],
    operation: OperationType,
}

impl RawSession {
    async fn open(
        http: &reqwest::Client,
        node: &KeyShareNodeMeta,
        creds: &UserCredentials,
        operation: OperationType,
    ) -> Self {
        let ephemeral = SigningKey::generate(&mut OsRng);
        let (status, body) = post(
            http,
            node,
            "/commit",
            None,
            json!({
                "operation_type": operation,
                "client_ephemeral_pubkey": hex::encode(ephemeral.verifying_key().to_bytes()),
                "id_token_hash": id_token_hash(&creds.auth_type, &creds.id_token),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        Self {
            ephemeral,
            session_id: body["data"]["cr_session_id"].as_str().unwrap().to_string(),
            node_pubkey: hex::decode(body["data"]["node_pubkey"].as_str().unwrap())
                .unwrap()
                .try_into()
                .unwrap(),
            operation,
        }
    }

    fn reveal(&self, creds: &UserCredentials, api: ApiName) -> Value {
        json!({
            "cr_session_id": self.session_id,
            "cr_signature": sign_reveal(
                &self.ephemeral,
                &self.node_pubkey,
                &self.session_id,
                &creds.auth_type,
                &creds.id_token,
                self.operation,
                api,
            ),
        })
    }
}

#[tokio::test]
async fn test_sign_up_then_sign_in() {
    let nodes = vec![spawn_node("ksn-a").await, spawn_node("ksn-b").await, spawn_node("ksn-c").await];
    let creds = credentials("alice@example.com");

    let checked = client(nodes.clone()).check_nodes(&creds, CurveType::Secp256k1).await;
    assert_eq!(checked.active_count(), 0);

    sign_up(&nodes, &creds).await;

    let fresh = client(nodes.clone());
    for curve in [CurveType::Secp256k1, CurveType::Ed25519] {
        let checked = fresh.check_nodes(&creds, curve).await;
        assert_eq!(checked.active_count(), 3, "{}", curve);
    }

    let checked = fresh.check_nodes(&creds, CurveType::Secp256k1).await;
    let recovered = client(checked.nodes).recover_key_share(&creds).await.unwrap();
    assert_eq!(recovered.secp256k1, Some(SECRET));
    assert_eq!(recovered.ed25519.unwrap().signing_share, SECRET);

    // another user sees nothing of alice's wallet
    let bob = credentials("bob@example.com");
    let err = client(with_status(&nodes, NodeWalletStatus::Active))
        .recover_key_share(&bob)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("insufficient"), "{}", err);
}

#[tokio::test]
async fn test_second_sign_up_is_rejected() {
    let nodes = vec![spawn_node("ksn-a").await, spawn_node("ksn-b").await];
    let creds = credentials("carol@example.com");
    sign_up(&nodes, &creds).await;

    let err = client(nodes)
        .register_key_shares(&creds, SECP_PK, &SECRET)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("WALLET_ALREADY_EXISTS"), "{}", err);
}

#[tokio::test]
async fn test_reshare_onto_new_node() {
    let original = vec![spawn_node("ksn-a").await, spawn_node("ksn-b").await, spawn_node("ksn-c").await];
    let creds = credentials("dave@example.com");
    sign_up(&original, &creds).await;

    let newcomer = spawn_node("ksn-d").await;
    let mut set = with_status(&original, NodeWalletStatus::Active);
    set.push(newcomer.clone());

    let reshared = client(set).reshare(&creds).await.unwrap();
    assert_eq!(reshared.active_count(), 4);

    let joined = client(vec![newcomer.clone()]);
    for curve in [CurveType::Secp256k1, CurveType::Ed25519] {
        let checked = joined.check_nodes(&creds, curve).await;
        assert_eq!(checked.nodes[0].wallet_status, NodeWalletStatus::Active, "{}", curve);
    }

    // the new share sits on the same polynomial as the old ones
    let pair = with_status(&[original[2].clone(), newcomer], NodeWalletStatus::Active);
    let recovered = client(pair).recover_key_share(&creds).await.unwrap();
    assert_eq!(recovered.secp256k1, Some(SECRET));
    assert_eq!(recovered.ed25519.unwrap().signing_share, SECRET);
}

#[tokio::test]
async fn test_tampered_reshare_is_refused() {
    let nodes = vec![spawn_node("ksn-a").await, spawn_node("ksn-b").await];
    let creds = credentials("erin@example.com");
    sign_up(&nodes, &creds).await;

    let http = reqwest::Client::new();
    let node = &nodes[0];
    let session = RawSession::open(&http, node, &creds, OperationType::Reshare).await;

    let (status, shares) = post(
        &http,
        node,
        "/keyshare/v2",
        Some(&creds),
        session.reveal(&creds, ApiName::GetKeyShares),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", shares);
    let genuine = shares["data"]["secp256k1"].clone();

    let share = genuine["share"].as_str().unwrap();
    let mut tampered = genuine.clone();
    tampered["share"] = json!(format!("{}{}", &share[..64], "07".repeat(32)));

    let mut body = session.reveal(&creds, ApiName::Reshare);
    body["secp256k1"] = tampered;
    let (status, response) = post(&http, node, "/reshare", Some(&creds), body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], "RESHARE_FAILED");

    // the refused call did not spend the session
    let mut body = session.reveal(&creds, ApiName::Reshare);
    body["secp256k1"] = genuine.clone();
    let (status, response) = post(&http, node, "/reshare", Some(&creds), body.clone()).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    assert!(response["data"]["reshared_at"].is_string());

    // reshare is terminal
    let (status, response) = post(&http, node, "/reshare", Some(&creds), body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], "INVALID_SESSION_STATE");
}

#[tokio::test]
async fn test_reveal_is_bound_to_one_api() {
    let nodes = vec![spawn_node("ksn-a").await, spawn_node("ksn-b").await];
    let creds = credentials("frank@example.com");
    sign_up(&nodes, &creds).await;

    let http = reqwest::Client::new();
    let node = &nodes[1];
    let session = RawSession::open(&http, node, &creds, OperationType::SignIn).await;

    // signed for register, presented to get_key_shares
    let (status, response) = post(
        &http,
        node,
        "/keyshare/v2",
        Some(&creds),
        session.reveal(&creds, ApiName::Register),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], "INVALID_SIGNATURE");

    // a sign_in session cannot register
    let mut body = session.reveal(&creds, ApiName::Register);
    body["public_key"] = json!(SECP_PK);
    body["share"] = json!("00".repeat(64));
    let (status, response) = post(&http, node, "/register", Some(&creds), body).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["code"], "API_NOT_ALLOWED");

    // another identity cannot use the session
    let mallory = credentials("mallory@example.com");
    let (status, response) = post(
        &http,
        node,
        "/keyshare/v2",
        Some(&mallory),
        session.reveal(&mallory, ApiName::GetKeyShares),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["code"], "UNAUTHORIZED");

    let (status, response) = post(
        &http,
        node,
        "/keyshare/v2",
        Some(&creds),
        session.reveal(&creds, ApiName::GetKeyShares),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    assert_eq!(response["data"]["secp256k1"]["public_key"], SECP_PK);
}
