//! Key-share node client
//!
//! Orchestrates sign-up, sign-in and reshare across a `NodeSet`. Every
//! operation opens one commit-reveal session per node under a fresh ephemeral
//! key, then fans the gated calls out in parallel and joins all results.
//! Nothing is retried and nothing written to a node is rolled back.

use ed25519_dalek::SigningKey;
use futures_util::future::join_all;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::commit_reveal::{id_token_hash, sign_reveal};
use crate::config::NodeSetFile;
use crate::crypto::CryptoEngine;
use crate::error::TssError;
use crate::ksn::AUTH_TYPE_HEADER;
use crate::logging::log_keyshare_event;
use crate::sss::{RecoveredTeddsaShare, SecretSharingEngine};
use crate::types::{
    decode_fixed, ApiName, ApiResponse, CheckResponse, CommitRequest, CommitResponse, CurveType, Ed25519ShareEntry,
    KeyShareNodeMeta, KeyShareRequest, KeyShareV2Response, NodeSet, NodeWalletStatus, OperationType,
    RegisterEd25519Request, RegisterRequest, RegisterResponse, ReshareRequest, ReshareResponse, SecpShareEntry,
    SharePoint, TeddsaKeyShare, UserKeySharePoint, UserTeddsaKeyShare,
};

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error at {node}: {message}")]
    Network { node: String, message: String },

    #[error("{node} rejected the call: {code}: {message}")]
    Node {
        node: String,
        code: String,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("insufficient key share nodes: need {required}, have {available}")]
    InsufficientNodes { required: usize, available: usize },

    #[error(transparent)]
    Sharing(#[from] TssError),

    #[error("{operation} failed on {} node(s): {}", .errors.len(), join_errors(.errors))]
    Joined {
        operation: &'static str,
        errors: Vec<ClientError>,
    },
}

fn join_errors(errors: &[ClientError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ClientError> for TssError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::InsufficientNodes { required, available } => {
                TssError::KeyshareNodeInsufficient { required, available }
            }
            ClientError::Sharing(inner) => inner,
            reshare @ ClientError::Joined {
                operation: "reshare",
                ..
            } => TssError::ReshareFailed(reshare.to_string()),
            other => TssError::unknown(other.to_string()),
        }
    }
}

/// Bearer token presented to every node
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub auth_type: String,
    pub id_token: String,
}

#[derive(Debug, Clone)]
struct NodeCommit {
    cr_session_id: String,
    node_pubkey: [u8; 32],
}

/// Commit-reveal sessions of one operation, keyed by node name
pub struct OperationSession {
    operation: OperationType,
    ephemeral: SigningKey,
    credentials: UserCredentials,
    commits: HashMap<String, NodeCommit>,
    commit_errors: HashMap<String, String>,
}

impl OperationSession {
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Session id opened on `node`, if its commit succeeded
    pub fn session_id(&self, node: &str) -> Option<&str> {
        self.commits.get(node).map(|c| c.cr_session_id.as_str())
    }

    pub fn committed_nodes(&self) -> usize {
        self.commits.len()
    }
}

/// Shares returned by one node
#[derive(Debug, Clone)]
pub struct NodeShares {
    pub node: KeyShareNodeMeta,
    pub shares: KeyShareV2Response,
}

/// Key material rebuilt on sign-in
#[derive(Debug, Clone, Default)]
pub struct RecoveredKeys {
    pub secp256k1: Option<[u8; 32]>,
    pub ed25519: Option<RecoveredTeddsaShare>,
}

pub struct KeyShareNodeClient {
    nodes: NodeSet,
    sss: SecretSharingEngine,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl KeyShareNodeClient {
    pub fn new(nodes: NodeSet, engine: Arc<dyn CryptoEngine>, timeout: Duration) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            nodes,
            sss: SecretSharingEngine::new(engine),
            http_client,
            timeout,
        })
    }

    /// Client for the node set described by a TOML file
    pub fn from_file(file: &NodeSetFile, engine: Arc<dyn CryptoEngine>) -> Result<Self, ClientError> {
        let nodes = NodeSet {
            nodes: file.node_metas(),
            threshold: file.threshold,
        };
        Self::new(nodes, engine, Duration::from_secs(file.timeout_secs))
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Replace the node set, e.g. with the result of `check_nodes`
    pub fn set_nodes(&mut self, nodes: NodeSet) {
        self.nodes = nodes;
    }

    // =========================================================================
    // Transport
    // =========================================================================

    async fn post<B, T>(
        &self,
        node: &KeyShareNodeMeta,
        path: &str,
        credentials: Option<&UserCredentials>,
        body: &B,
    ) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http_client
            .post(format!("{}{}", node.endpoint, path))
            .timeout(self.timeout)
            .json(body);
        if let Some(credentials) = credentials {
            request = request
                .bearer_auth(&credentials.id_token)
                .header(AUTH_TYPE_HEADER, &credentials.auth_type);
        }

        let response = request.send().await.map_err(|e| ClientError::Network {
            node: node.name.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();
        let envelope: ApiResponse<T> = response.json().await.map_err(|e| {
            ClientError::Protocol(format!("{} answered {} with an unreadable body: {}", node.name, status, e))
        })?;

        match envelope {
            ApiResponse {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            ApiResponse { code, msg, .. } => Err(ClientError::Node {
                node: node.name.clone(),
                code: code.unwrap_or_else(|| status.to_string()),
                message: msg.unwrap_or_default(),
            }),
        }
    }

    /// `(cr_session_id, cr_signature)` for one gated call
    fn reveal(
        &self,
        session: &OperationSession,
        node: &KeyShareNodeMeta,
        api: ApiName,
    ) -> Result<(String, String), ClientError> {
        let commit = session.commits.get(&node.name).ok_or_else(|| {
            let reason = session
                .commit_errors
                .get(&node.name)
                .map(String::as_str)
                .unwrap_or("node was not part of the operation");
            ClientError::Protocol(format!("no commit-reveal session on {}: {}", node.name, reason))
        })?;

        let signature = sign_reveal(
            &session.ephemeral,
            &commit.node_pubkey,
            &commit.cr_session_id,
            &session.credentials.auth_type,
            &session.credentials.id_token,
            session.operation,
            api,
        );
        Ok((commit.cr_session_id.clone(), signature))
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Open a commit-reveal session for `operation` on every node in `nodes`
    pub async fn commit(
        &self,
        operation: OperationType,
        credentials: &UserCredentials,
        nodes: &[KeyShareNodeMeta],
    ) -> OperationSession {
        let ephemeral = SigningKey::generate(&mut OsRng);
        let request = CommitRequest {
            operation_type: operation,
            client_ephemeral_pubkey: hex::encode(ephemeral.verifying_key().to_bytes()),
            id_token_hash: id_token_hash(&credentials.auth_type, &credentials.id_token),
        };

        let results = join_all(nodes.iter().map(|node| {
            let request = &request;
            async move {
                let result = self
                    .post::<_, CommitResponse>(node, "/commit", None, request)
                    .await
                    .and_then(|response| {
                        let node_pubkey = decode_fixed::<32>(&response.node_pubkey)
                            .map_err(|e| ClientError::Protocol(format!("{} node_pubkey: {}", node.name, e)))?;
                        Ok(NodeCommit {
                            cr_session_id: response.cr_session_id,
                            node_pubkey,
                        })
                    });
                (node, result)
            }
        }))
        .await;

        let mut commits = HashMap::new();
        let mut commit_errors = HashMap::new();
        for (node, result) in results {
            match result {
                Ok(commit) => {
                    commits.insert(node.name.clone(), commit);
                }
                Err(e) => {
                    tracing::warn!(node = %node.name, error = %e, "Commit failed");
                    commit_errors.insert(node.name.clone(), e.to_string());
                }
            }
        }
        log_keyshare_event("commit", commits.len(), commit_errors.len(), None);

        OperationSession {
            operation,
            ephemeral,
            credentials: credentials.clone(),
            commits,
            commit_errors,
        }
    }

    // =========================================================================
    // Check
    // =========================================================================

    /// Ask every node for its status on `curve`.
    /// Unreachable nodes keep the status they had.
    pub async fn check_nodes(&self, credentials: &UserCredentials, curve: CurveType) -> NodeSet {
        let results = join_all(self.nodes.nodes.iter().map(|node| async move {
            let result = self
                .post::<_, CheckResponse>(node, "/check", Some(credentials), &serde_json::json!({}))
                .await;
            (node, result)
        }))
        .await;

        let mut failed = 0;
        let nodes = results
            .into_iter()
            .map(|(node, result)| {
                let mut node = node.clone();
                match result {
                    Ok(check) => node.wallet_status = check.status_for(curve),
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(node = %node.name, error = %e, "Node check failed");
                    }
                }
                node
            })
            .collect::<Vec<_>>();
        log_keyshare_event("check", nodes.len() - failed, failed, None);

        NodeSet {
            nodes,
            threshold: self.nodes.threshold,
        }
    }

    // =========================================================================
    // Sign-in
    // =========================================================================

    async fn fetch_shares(
        &self,
        session: &OperationSession,
        node: &KeyShareNodeMeta,
    ) -> Result<KeyShareV2Response, ClientError> {
        let (cr_session_id, cr_signature) = self.reveal(session, node, ApiName::GetKeyShares)?;
        self.post(
            node,
            "/keyshare/v2",
            Some(&session.credentials),
            &KeyShareRequest {
                cr_session_id,
                cr_signature,
            },
        )
        .await
    }

    /// `get_key_shares` on every ACTIVE node; tolerates `|ACTIVE| - threshold` failures
    pub async fn request_key_shares(&self, session: &OperationSession) -> Result<Vec<NodeShares>, ClientError> {
        let required = usize::from(self.nodes.threshold);
        let active: Vec<&KeyShareNodeMeta> = self.nodes.active().collect();
        if active.len() < required {
            return Err(ClientError::InsufficientNodes {
                required,
                available: active.len(),
            });
        }

        let results = join_all(active.into_iter().map(|node| async move {
            (node, self.fetch_shares(session, node).await)
        }))
        .await;

        let mut shares = Vec::new();
        let mut failed = 0;
        for (node, result) in results {
            match result {
                Ok(response) => shares.push(NodeShares {
                    node: node.clone(),
                    shares: response,
                }),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(node = %node.name, error = %e, "Key share request failed");
                }
            }
        }
        log_keyshare_event("get_key_shares", shares.len(), failed, None);

        if shares.len() < required {
            return Err(ClientError::InsufficientNodes {
                required,
                available: shares.len(),
            });
        }
        Ok(shares)
    }

    /// Sign-in: fetch shares from the ACTIVE nodes and combine them
    pub async fn recover_key_share(&self, credentials: &UserCredentials) -> Result<RecoveredKeys, ClientError> {
        let active: Vec<KeyShareNodeMeta> = self.nodes.active().cloned().collect();
        let session = self.commit(OperationType::SignIn, credentials, &active).await;
        let fetched = self.request_key_shares(&session).await?;
        let threshold = self.nodes.threshold;

        let points = secp_points(&fetched)?;
        let teddsa = teddsa_shares(&fetched)?;
        let mut recovered = RecoveredKeys::default();

        if !points.is_empty() {
            require_quorum(points.len(), threshold)?;
            recovered.secp256k1 = Some(self.sss.combine(&points, threshold)?);
        }
        if !teddsa.is_empty() {
            require_quorum(teddsa.len(), threshold)?;
            recovered.ed25519 = Some(self.sss.combine_teddsa(&teddsa, threshold)?);
        }
        if recovered.secp256k1.is_none() && recovered.ed25519.is_none() {
            return Err(ClientError::Protocol("nodes returned no key shares".to_string()));
        }
        Ok(recovered)
    }

    // =========================================================================
    // Sign-up
    // =========================================================================

    async fn register_secp(
        &self,
        session: &OperationSession,
        node: &KeyShareNodeMeta,
        entry: &SecpShareEntry,
    ) -> Result<RegisterResponse, ClientError> {
        let (cr_session_id, cr_signature) = self.reveal(session, node, ApiName::Register)?;
        self.post(
            node,
            "/register",
            Some(&session.credentials),
            &RegisterRequest {
                cr_session_id,
                cr_signature,
                public_key: entry.public_key.clone(),
                share: entry.share.clone(),
            },
        )
        .await
    }

    async fn register_ed25519(
        &self,
        session: &OperationSession,
        node: &KeyShareNodeMeta,
        entry: &Ed25519ShareEntry,
    ) -> Result<RegisterResponse, ClientError> {
        let (cr_session_id, cr_signature) = self.reveal(session, node, ApiName::Register)?;
        self.post(
            node,
            "/register/ed25519",
            Some(&session.credentials),
            &RegisterEd25519Request {
                cr_session_id,
                cr_signature,
                public_key: entry.public_key.clone(),
                identifier: entry.identifier.clone(),
                signing_share: entry.signing_share.clone(),
            },
        )
        .await
    }

    /// Sign-up: split the secp256k1 key fragment and register it on every node
    pub async fn register_key_shares(
        &self,
        credentials: &UserCredentials,
        public_key: &str,
        secret: &[u8; 32],
    ) -> Result<(), ClientError> {
        let points = self.sss.split(secret, &self.nodes.nodes, self.nodes.threshold)?;
        let session = self.commit(OperationType::SignUp, credentials, &self.nodes.nodes).await;

        let results = join_all(points.iter().map(|point| {
            let entry = SecpShareEntry {
                public_key: public_key.to_string(),
                share: point.share.to_hex(),
            };
            let session = &session;
            async move { self.register_secp(session, &point.node, &entry).await }
        }))
        .await;
        collect_joined("register", results)
    }

    /// Sign-up for ed25519: split the FROST signing share and register it on every node
    pub async fn register_teddsa_shares(
        &self,
        credentials: &UserCredentials,
        public_key: &str,
        signing_share: &[u8; 32],
    ) -> Result<(), ClientError> {
        let shares = self
            .sss
            .split_teddsa(signing_share, &self.nodes.nodes, self.nodes.threshold)?;
        let session = self.commit(OperationType::SignUp, credentials, &self.nodes.nodes).await;

        let results = join_all(shares.iter().map(|share| {
            let entry = ed25519_entry(public_key, &share.share);
            let session = &session;
            async move { self.register_ed25519(session, &share.node, &entry).await }
        }))
        .await;
        collect_joined("register", results)
    }

    // =========================================================================
    // Reshare
    // =========================================================================

    /// Extend the sharing to every node in the set.
    ///
    /// ACTIVE nodes get `/reshare` with the share they should already hold;
    /// the others are registered under their own sign-up sessions. On success
    /// the returned set has every node ACTIVE.
    pub async fn reshare(&self, credentials: &UserCredentials) -> Result<NodeSet, ClientError> {
        let threshold = self.nodes.threshold;
        let active: Vec<KeyShareNodeMeta> = self.nodes.active().cloned().collect();
        require_quorum(active.len(), threshold)?;

        let session = self.commit(OperationType::Reshare, credentials, &active).await;
        let fetched = self.request_key_shares(&session).await?;

        let answered: HashSet<&str> = fetched.iter().map(|f| f.node.name.as_str()).collect();
        let missing: Vec<KeyShareNodeMeta> = self
            .nodes
            .nodes
            .iter()
            .filter(|n| !answered.contains(n.name.as_str()))
            .cloned()
            .collect();

        let points = secp_points(&fetched)?;
        let teddsa = teddsa_shares(&fetched)?;

        let mut secp_entries: HashMap<String, SecpShareEntry> = HashMap::new();
        let secp_key = agreed_key(fetched.iter().filter_map(|f| f.shares.secp256k1.as_ref().map(|e| &e.public_key)))?;
        if let Some(public_key) = secp_key {
            let expanded = self.sss.expand_shares(&points, &missing, threshold)?;
            for point in expanded.reshared {
                secp_entries.insert(
                    point.node.name.clone(),
                    SecpShareEntry {
                        public_key: public_key.clone(),
                        share: point.share.to_hex(),
                    },
                );
            }
        }

        let mut ed_entries: HashMap<String, Ed25519ShareEntry> = HashMap::new();
        let ed_key = agreed_key(fetched.iter().filter_map(|f| f.shares.ed25519.as_ref().map(|e| &e.public_key)))?;
        if let Some(public_key) = ed_key {
            let expanded = self.sss.expand_teddsa_shares(&teddsa, &missing, threshold)?;
            for share in expanded.reshared {
                ed_entries.insert(share.node.name.clone(), ed25519_entry(&public_key, &share.share));
            }
        }

        if secp_entries.is_empty() && ed_entries.is_empty() {
            return Err(ClientError::Protocol("nodes returned no key shares".to_string()));
        }

        let results = join_all(self.nodes.nodes.iter().map(|node| {
            let secp = secp_entries.get(&node.name).cloned();
            let ed = ed_entries.get(&node.name).cloned();
            let session = &session;
            async move { self.deliver(session, credentials, node, secp, ed).await }
        }))
        .await;

        collect_joined("reshare", results)?;
        Ok(NodeSet {
            nodes: self
                .nodes
                .nodes
                .iter()
                .map(|n| KeyShareNodeMeta {
                    wallet_status: NodeWalletStatus::Active,
                    ..n.clone()
                })
                .collect(),
            threshold,
        })
    }

    async fn deliver(
        &self,
        session: &OperationSession,
        credentials: &UserCredentials,
        node: &KeyShareNodeMeta,
        secp: Option<SecpShareEntry>,
        ed: Option<Ed25519ShareEntry>,
    ) -> Result<(), ClientError> {
        if node.wallet_status == NodeWalletStatus::Active {
            let (cr_session_id, cr_signature) = self.reveal(session, node, ApiName::Reshare)?;
            let _: ReshareResponse = self
                .post(
                    node,
                    "/reshare",
                    Some(credentials),
                    &ReshareRequest {
                        cr_session_id,
                        cr_signature,
                        secp256k1: secp,
                        ed25519: ed,
                    },
                )
                .await?;
            return Ok(());
        }

        // register is terminal for sign_up, so each curve needs its own session
        let target = std::slice::from_ref(node);
        if let Some(entry) = secp {
            let sign_up = self.commit(OperationType::SignUp, credentials, target).await;
            self.register_secp(&sign_up, node, &entry).await?;
        }
        if let Some(entry) = ed {
            let sign_up = self.commit(OperationType::SignUp, credentials, target).await;
            self.register_ed25519(&sign_up, node, &entry).await?;
        }
        Ok(())
    }
}

fn ed25519_entry(public_key: &str, share: &TeddsaKeyShare) -> Ed25519ShareEntry {
    Ed25519ShareEntry {
        public_key: public_key.to_string(),
        identifier: hex::encode(share.identifier),
        signing_share: hex::encode(share.signing_share),
    }
}

fn require_quorum(available: usize, threshold: u16) -> Result<(), ClientError> {
    let required = usize::from(threshold);
    if available < required {
        return Err(ClientError::InsufficientNodes { required, available });
    }
    Ok(())
}

/// The single public key every node reported, if any reported one
fn agreed_key<'a>(mut keys: impl Iterator<Item = &'a String>) -> Result<Option<String>, ClientError> {
    let Some(first) = keys.next() else {
        return Ok(None);
    };
    if keys.any(|k| k != first) {
        return Err(ClientError::Protocol("nodes disagree on the public key".to_string()));
    }
    Ok(Some(first.clone()))
}

fn secp_points(fetched: &[NodeShares]) -> Result<Vec<UserKeySharePoint>, ClientError> {
    fetched
        .iter()
        .filter_map(|f| f.shares.secp256k1.as_ref().map(|entry| (f, entry)))
        .map(|(f, entry)| {
            let share = SharePoint::from_hex(&entry.share)
                .map_err(|e| ClientError::Protocol(format!("{} share: {}", f.node.name, e)))?;
            Ok(UserKeySharePoint {
                node: f.node.clone(),
                share,
            })
        })
        .collect()
}

fn teddsa_shares(fetched: &[NodeShares]) -> Result<Vec<UserTeddsaKeyShare>, ClientError> {
    fetched
        .iter()
        .filter_map(|f| f.shares.ed25519.as_ref().map(|entry| (f, entry)))
        .map(|(f, entry)| {
            let bad = |e: String| ClientError::Protocol(format!("{} ed25519 share: {}", f.node.name, e));
            Ok(UserTeddsaKeyShare {
                node: f.node.clone(),
                share: TeddsaKeyShare {
                    identifier: decode_fixed(&entry.identifier).map_err(bad)?,
                    signing_share: decode_fixed(&entry.signing_share).map_err(bad)?,
                },
            })
        })
        .collect()
}

fn collect_joined<T>(operation: &'static str, results: Vec<Result<T, ClientError>>) -> Result<(), ClientError> {
    let total = results.len();
    let errors: Vec<ClientError> = results.into_iter().filter_map(Result::err).collect();
    log_keyshare_event(operation, total - errors.len(), errors.len(), None);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ClientError::Joined { operation, errors })
    }
}
