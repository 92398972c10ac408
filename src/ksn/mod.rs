//! Key-share node
//!
//! A node holds one sealed share per (user, curve) and hands it back only
//! through commit-reveal gated calls.

pub mod server;
pub mod service;

pub use server::{bearer_credentials, create_router, SharedKsnState, AUTH_TYPE_HEADER};
pub use service::{KeyShareNodeService, KSN_SHARE_DOMAIN};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::sync::Arc;

use crate::commit_reveal::CommitRevealGuard;
use crate::config::{ConfigError, Environment, KsnConfig};
use crate::crypto::{CryptoEngine, SoftwareEngine};
use crate::identity::{IdentityVerifier, JwtClaimsVerifier};
use crate::share_cipher::ShareCipher;
use crate::storage::{KsnStore, SqliteKsnStore, StorageError};

pub struct KsnState {
    pub service: KeyShareNodeService,
    pub guard: CommitRevealGuard,
    pub identity: Arc<dyn IdentityVerifier>,
    pub engine: Arc<dyn CryptoEngine>,
}

impl KsnState {
    pub fn new(
        store: Arc<dyn KsnStore>,
        engine: Arc<dyn CryptoEngine>,
        identity: Arc<dyn IdentityVerifier>,
        node_key: &SigningKey,
        config: &KsnConfig,
    ) -> Self {
        let cipher = ShareCipher::new(config.share_password.clone(), KSN_SHARE_DOMAIN);
        Self {
            service: KeyShareNodeService::new(store.clone(), engine.clone(), cipher, config.node_name.clone()),
            guard: CommitRevealGuard::new(store, node_key, config.cr_session_ttl_secs),
            identity,
            engine,
        }
    }

    /// In-memory node with a fresh key, accepting any token issuer
    pub fn in_memory(node_name: &str, environment: Environment) -> Result<Self, StorageError> {
        let config = KsnConfig {
            environment,
            bind: "127.0.0.1:0".to_string(),
            db_path: ":memory:".to_string(),
            node_name: node_name.to_string(),
            node_key: None,
            share_password: format!("{}-password", node_name),
            cr_session_ttl_secs: 300,
            allowed_issuers: Vec::new(),
            log_level: "info".to_string(),
        };
        Ok(Self::new(
            Arc::new(SqliteKsnStore::in_memory()?),
            Arc::new(SoftwareEngine::new()),
            Arc::new(JwtClaimsVerifier::default()),
            &SigningKey::generate(&mut OsRng),
            &config,
        ))
    }
}

/// Node identity key from config; development generates an ephemeral one
pub fn node_signing_key(config: &KsnConfig) -> Result<SigningKey, ConfigError> {
    match &config.node_key {
        Some(raw) => {
            let bytes: [u8; 32] = crate::types::decode_fixed(raw)
                .map_err(|e| ConfigError::InvalidValue("KSN_NODE_KEY".to_string(), e))?;
            Ok(SigningKey::from_bytes(&bytes))
        }
        None if config.environment == Environment::Development => {
            tracing::warn!("KSN_NODE_KEY not set, using an ephemeral node key");
            Ok(SigningKey::generate(&mut OsRng))
        }
        None => Err(ConfigError::MissingEnvVar("KSN_NODE_KEY".to_string())),
    }
}
