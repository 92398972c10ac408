//! Commit-reveal authentication for key-share node calls
//!
//! A client first commits `sha256(auth_type ‖ id_token)` and an ephemeral
//! ed25519 key (`POST /commit`). Every gated call then reveals the id_token
//! and a signature over
//!
//! ```text
//! node_pubkey ‖ session_id ‖ auth_type ‖ id_token ‖ operation_type ‖ api_name
//! ```
//!
//! so a reveal is only valid for one node, one session, one identity and one
//! API. Each `(session_id, api_name)` pair is consumed at most once.

use chrono::{Duration, Utc};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, TssError};
use crate::logging::log_security_event;
use crate::storage::{KsnStore, StorageError};
use crate::types::{
    decode_fixed, ApiName, CommitRequest, CommitResponse, CommitRevealApiCall, CommitRevealSession,
    CrSessionState, OperationType, RevealFields,
};

/// Hex `sha256(auth_type ‖ id_token)`
pub fn id_token_hash(auth_type: &str, id_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(auth_type.as_bytes());
    hasher.update(id_token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Bytes covered by the reveal signature
pub fn reveal_message(
    node_pubkey: &[u8; 32],
    session_id: &str,
    auth_type: &str,
    id_token: &str,
    operation: OperationType,
    api: ApiName,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(32 + session_id.len() + auth_type.len() + id_token.len() + 32);
    message.extend_from_slice(node_pubkey);
    message.extend_from_slice(session_id.as_bytes());
    message.extend_from_slice(auth_type.as_bytes());
    message.extend_from_slice(id_token.as_bytes());
    message.extend_from_slice(operation.as_str().as_bytes());
    message.extend_from_slice(api.as_str().as_bytes());
    message
}

/// Client side: hex signature for one reveal
pub fn sign_reveal(
    ephemeral: &SigningKey,
    node_pubkey: &[u8; 32],
    session_id: &str,
    auth_type: &str,
    id_token: &str,
    operation: OperationType,
    api: ApiName,
) -> String {
    use ed25519_dalek::Signer;
    let message = reveal_message(node_pubkey, session_id, auth_type, id_token, operation, api);
    hex::encode(ephemeral.sign(&message).to_bytes())
}

/// Bearer credentials presented with a reveal
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub auth_type: &'a str,
    pub id_token: &'a str,
}

/// A reveal that passed every check, waiting to be consumed
#[derive(Debug, Clone)]
pub struct AcceptedReveal {
    pub session: CommitRevealSession,
    pub api: ApiName,
    pub signature: String,
}

pub struct CommitRevealGuard {
    store: Arc<dyn KsnStore>,
    node_pubkey: [u8; 32],
    ttl: Duration,
}

impl CommitRevealGuard {
    pub fn new(store: Arc<dyn KsnStore>, node_key: &SigningKey, ttl_secs: i64) -> Self {
        Self {
            store,
            node_pubkey: node_key.verifying_key().to_bytes(),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub fn node_pubkey(&self) -> &[u8; 32] {
        &self.node_pubkey
    }

    /// Open a session in `COMMITTED`
    pub async fn commit(&self, request: &CommitRequest) -> Result<CommitResponse> {
        let ephemeral: [u8; 32] = decode_fixed(&request.client_ephemeral_pubkey)
            .map_err(|e| TssError::InvalidRequest(format!("client_ephemeral_pubkey: {}", e)))?;
        VerifyingKey::from_bytes(&ephemeral)
            .map_err(|_| TssError::InvalidRequest("client_ephemeral_pubkey is not an ed25519 key".to_string()))?;
        decode_fixed::<32>(&request.id_token_hash)
            .map_err(|e| TssError::InvalidRequest(format!("id_token_hash: {}", e)))?;

        let now = Utc::now();
        let session = CommitRevealSession {
            session_id: Uuid::new_v4().to_string(),
            operation_type: request.operation_type,
            client_ephemeral_pubkey: hex::encode(ephemeral),
            id_token_hash: request.id_token_hash.trim_start_matches("0x").to_lowercase(),
            state: CrSessionState::Committed,
            node_pubkey: hex::encode(self.node_pubkey),
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.create_cr_session(&session).await?;

        log_security_event(
            "cr_commit",
            true,
            serde_json::json!({ "operation": session.operation_type.as_str() }),
            Some(&session.session_id),
        );

        Ok(CommitResponse {
            cr_session_id: session.session_id,
            node_pubkey: session.node_pubkey,
            expires_at: session.expires_at,
        })
    }

    /// Run every reveal check in order; nothing is written
    pub async fn verify_reveal(
        &self,
        api: ApiName,
        reveal: &RevealFields,
        credentials: Option<Credentials<'_>>,
    ) -> Result<AcceptedReveal> {
        let result = self.check_reveal(api, reveal, credentials).await;
        if let Err(err) = &result {
            log_security_event(
                "cr_reveal_rejected",
                false,
                serde_json::json!({ "api": api.as_str(), "code": err.code() }),
                reveal.cr_session_id.as_deref(),
            );
        }
        result
    }

    async fn check_reveal(
        &self,
        api: ApiName,
        reveal: &RevealFields,
        credentials: Option<Credentials<'_>>,
    ) -> Result<AcceptedReveal> {
        let (session_id, signature) = match (&reveal.cr_session_id, &reveal.cr_signature) {
            (Some(id), Some(sig)) if !id.is_empty() && !sig.is_empty() => (id.as_str(), sig.as_str()),
            _ => {
                return Err(TssError::InvalidRequest(
                    "cr_session_id and cr_signature are required".to_string(),
                ))
            }
        };
        let credentials = credentials
            .filter(|c| !c.id_token.is_empty())
            .ok_or_else(|| TssError::Unauthorized("missing bearer id_token".to_string()))?;

        let session = self
            .store
            .get_cr_session(session_id)
            .await?
            .ok_or(TssError::SessionNotFound)?;
        if session.state != CrSessionState::Committed {
            return Err(TssError::InvalidSessionState(session.state.as_str().to_string()));
        }
        if Utc::now() >= session.expires_at {
            return Err(TssError::SessionExpired);
        }

        if !session.operation_type.allows(api) {
            return Err(TssError::ApiNotAllowed {
                api: api.to_string(),
                operation: session.operation_type.as_str().to_string(),
            });
        }

        if self.store.is_api_called(session_id, api).await? {
            return Err(TssError::ApiAlreadyCalled(api.to_string()));
        }

        if id_token_hash(credentials.auth_type, credentials.id_token) != session.id_token_hash {
            return Err(TssError::Unauthorized("id_token does not match commitment".to_string()));
        }

        let ephemeral: [u8; 32] = decode_fixed(&session.client_ephemeral_pubkey)
            .map_err(|e| TssError::unknown(format!("stored ephemeral key: {}", e)))?;
        let verifying_key = VerifyingKey::from_bytes(&ephemeral).map_err(|_| TssError::InvalidSignature)?;
        let sig_bytes: [u8; 64] = decode_fixed(signature).map_err(|_| TssError::InvalidSignature)?;
        let message = reveal_message(
            &self.node_pubkey,
            session_id,
            credentials.auth_type,
            credentials.id_token,
            session.operation_type,
            api,
        );
        verifying_key
            .verify_strict(&message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| TssError::InvalidSignature)?;

        Ok(AcceptedReveal {
            session,
            api,
            signature: signature.to_string(),
        })
    }

    /// Record the call, closing the session on the operation's terminal API.
    /// Losing the race to a concurrent call is `API_ALREADY_CALLED`.
    pub async fn consume(&self, accepted: &AcceptedReveal) -> Result<()> {
        let call = CommitRevealApiCall {
            session_id: accepted.session.session_id.clone(),
            api_name: accepted.api,
            signature: accepted.signature.clone(),
            created_at: Utc::now(),
        };
        let terminal = accepted.session.operation_type.terminal_api() == accepted.api;

        match self.store.consume_api_call(&call, terminal).await {
            Ok(()) => {
                log_security_event(
                    "cr_consumed",
                    true,
                    serde_json::json!({ "api": accepted.api.as_str(), "terminal": terminal }),
                    Some(&call.session_id),
                );
                Ok(())
            }
            Err(StorageError::AlreadyCalled(_)) | Err(StorageError::Conflict(_)) => {
                Err(TssError::ApiAlreadyCalled(accepted.api.to_string()))
            }
            Err(other) => Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteKsnStore;
    use rand::rngs::OsRng;

    const AUTH: &str = "google";
    const TOKEN: &str = "header.payload.sig";

    struct Fixture {
        guard: CommitRevealGuard,
        ephemeral: SigningKey,
    }

    fn fixture(ttl_secs: i64) -> Fixture {
        let store = Arc::new(SqliteKsnStore::in_memory().unwrap());
        let node_key = SigningKey::generate(&mut OsRng);
        Fixture {
            guard: CommitRevealGuard::new(store, &node_key, ttl_secs),
            ephemeral: SigningKey::generate(&mut OsRng),
        }
    }

    impl Fixture {
        async fn open(&self, operation: OperationType) -> CommitResponse {
            self.guard
                .commit(&CommitRequest {
                    operation_type: operation,
                    client_ephemeral_pubkey: hex::encode(self.ephemeral.verifying_key().to_bytes()),
                    id_token_hash: id_token_hash(AUTH, TOKEN),
                })
                .await
                .unwrap()
        }

        fn reveal(&self, session_id: &str, operation: OperationType, api: ApiName) -> RevealFields {
            RevealFields {
                cr_session_id: Some(session_id.to_string()),
                cr_signature: Some(sign_reveal(
                    &self.ephemeral,
                    self.guard.node_pubkey(),
                    session_id,
                    AUTH,
                    TOKEN,
                    operation,
                    api,
                )),
            }
        }
    }

    fn creds() -> Option<Credentials<'static>> {
        Some(Credentials {
            auth_type: AUTH,
            id_token: TOKEN,
        })
    }

    #[tokio::test]
    async fn test_reveal_then_consume_once() {
        let f = fixture(300);
        let opened = f.open(OperationType::SignIn).await;
        let reveal = f.reveal(&opened.cr_session_id, OperationType::SignIn, ApiName::GetKeyShares);

        let accepted = f.guard.verify_reveal(ApiName::GetKeyShares, &reveal, creds()).await.unwrap();
        f.guard.consume(&accepted).await.unwrap();

        // terminal api closed the session
        let err = f
            .guard
            .verify_reveal(ApiName::GetKeyShares, &reveal, creds())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SESSION_STATE");

        // a second consume of the same acceptance loses
        let err = f.guard.consume(&accepted).await.unwrap_err();
        assert_eq!(err.code(), "API_ALREADY_CALLED");
    }

    #[tokio::test]
    async fn test_replayed_non_terminal_call_is_409() {
        let f = fixture(300);
        let opened = f.open(OperationType::Reshare).await;
        let reveal = f.reveal(&opened.cr_session_id, OperationType::Reshare, ApiName::GetKeyShares);

        let accepted = f.guard.verify_reveal(ApiName::GetKeyShares, &reveal, creds()).await.unwrap();
        f.guard.consume(&accepted).await.unwrap();

        let err = f
            .guard
            .verify_reveal(ApiName::GetKeyShares, &reveal, creds())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "API_ALREADY_CALLED");
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_signature_bound_to_api() {
        let f = fixture(300);
        let opened = f.open(OperationType::Reshare).await;
        let reveal = f.reveal(&opened.cr_session_id, OperationType::Reshare, ApiName::GetKeyShares);

        let err = f.guard.verify_reveal(ApiName::Reshare, &reveal, creds()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn test_check_order() {
        let f = fixture(300);
        let opened = f.open(OperationType::SignIn).await;
        let reveal = f.reveal(&opened.cr_session_id, OperationType::SignIn, ApiName::GetKeyShares);

        let err = f
            .guard
            .verify_reveal(ApiName::GetKeyShares, &RevealFields::default(), creds())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let err = f.guard.verify_reveal(ApiName::GetKeyShares, &reveal, None).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        let missing = RevealFields {
            cr_session_id: Some("nope".to_string()),
            cr_signature: Some("00".to_string()),
        };
        let err = f.guard.verify_reveal(ApiName::GetKeyShares, &missing, creds()).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");

        let err = f.guard.verify_reveal(ApiName::Register, &reveal, creds()).await.unwrap_err();
        assert_eq!(err.code(), "API_NOT_ALLOWED");

        let other_token = Some(Credentials {
            auth_type: AUTH,
            id_token: "someone.else.token",
        });
        let err = f
            .guard
            .verify_reveal(ApiName::GetKeyShares, &reveal, other_token)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_expired_session() {
        let f = fixture(0);
        let opened = f.open(OperationType::SignUp).await;
        let reveal = f.reveal(&opened.cr_session_id, OperationType::SignUp, ApiName::Register);

        let err = f.guard.verify_reveal(ApiName::Register, &reveal, creds()).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_EXPIRED");
    }

    #[tokio::test]
    async fn test_signature_bound_to_node() {
        let f = fixture(300);
        let opened = f.open(OperationType::SignIn).await;
        let other_node = SigningKey::generate(&mut OsRng).verifying_key().to_bytes();
        let reveal = RevealFields {
            cr_session_id: Some(opened.cr_session_id.clone()),
            cr_signature: Some(sign_reveal(
                &f.ephemeral,
                &other_node,
                &opened.cr_session_id,
                AUTH,
                TOKEN,
                OperationType::SignIn,
                ApiName::GetKeyShares,
            )),
        };

        let err = f
            .guard
            .verify_reveal(ApiName::GetKeyShares, &reveal, creds())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SIGNATURE");
    }

    #[tokio::test]
    async fn test_commit_rejects_bad_key() {
        let f = fixture(300);
        let err = f
            .guard
            .commit(&CommitRequest {
                operation_type: OperationType::SignIn,
                client_ephemeral_pubkey: "abcd".to_string(),
                id_token_hash: id_token_hash(AUTH, TOKEN),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
