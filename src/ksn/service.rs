//! Key-share node business logic
//!
//! Every method runs after the caller's identity has been established (by the
//! commit-reveal guard, or by the bearer token for `/check`). Shares are
//! sealed with `ShareCipher` before they reach SQLite.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::software::decode_public_key;
use crate::crypto::CryptoEngine;
use crate::error::{Result, TssError};
use crate::identity::Identity;
use crate::share_cipher::{CipherError, ShareCipher};
use crate::storage::{KsnStore, StorageError};
use crate::types::{
    decode_fixed, CheckResponse, CurveType, Ed25519ShareEntry, KeyShareRecord, KeyShareV1Response,
    KeyShareV2Response, NodeWalletStatus, RegisterResponse, ReshareResponse, SecpShareEntry, SharePoint,
    TeddsaKeyShare, WALLET_STATUS_ACTIVE,
};

/// Domain tag for shares sealed at rest on a node
pub const KSN_SHARE_DOMAIN: &str = "ksn-share-v1";

fn normalize_hex(value: &str) -> String {
    value.trim_start_matches("0x").to_lowercase()
}

fn sealed_err(err: CipherError) -> TssError {
    TssError::unknown(format!("share cipher: {}", err))
}

pub struct KeyShareNodeService {
    store: Arc<dyn KsnStore>,
    engine: Arc<dyn CryptoEngine>,
    cipher: ShareCipher,
    node_name: String,
}

impl KeyShareNodeService {
    pub fn new(
        store: Arc<dyn KsnStore>,
        engine: Arc<dyn CryptoEngine>,
        cipher: ShareCipher,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            engine,
            cipher,
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn user(&self, identity: &Identity) -> Result<Uuid> {
        self.store
            .find_user(&identity.auth_type, &identity.user_identifier)
            .await?
            .ok_or(TssError::UserNotFound)
    }

    async fn record(&self, user_id: Uuid, curve: CurveType) -> Result<Option<KeyShareRecord>> {
        Ok(self.store.get_key_share(user_id, curve).await?)
    }

    fn open_secp(&self, record: &KeyShareRecord) -> Result<SecpShareEntry> {
        let raw = self.cipher.open(&record.enc_share).map_err(sealed_err)?;
        Ok(SecpShareEntry {
            public_key: record.public_key.clone(),
            share: hex::encode(raw),
        })
    }

    fn open_ed25519(&self, record: &KeyShareRecord) -> Result<Ed25519ShareEntry> {
        let share: TeddsaKeyShare = self.cipher.open_json(&record.enc_share).map_err(sealed_err)?;
        Ok(Ed25519ShareEntry {
            public_key: record.public_key.clone(),
            identifier: hex::encode(share.identifier),
            signing_share: hex::encode(share.signing_share),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// secp256k1 share only
    pub async fn get_key_share_v1(&self, identity: &Identity) -> Result<KeyShareV1Response> {
        let user_id = self.user(identity).await?;
        let record = self
            .record(user_id, CurveType::Secp256k1)
            .await?
            .ok_or(TssError::KeyShareNotFound)?;
        let entry = self.open_secp(&record)?;
        Ok(KeyShareV1Response {
            public_key: entry.public_key,
            share: entry.share,
        })
    }

    /// Every share this node holds for the user
    pub async fn get_key_shares_v2(&self, identity: &Identity) -> Result<KeyShareV2Response> {
        let user_id = self.user(identity).await?;

        let mut response = KeyShareV2Response::default();
        if let Some(record) = self.record(user_id, CurveType::Secp256k1).await? {
            response.secp256k1 = Some(self.open_secp(&record)?);
        }
        if let Some(record) = self.record(user_id, CurveType::Ed25519).await? {
            response.ed25519 = Some(self.open_ed25519(&record)?);
        }

        if response.secp256k1.is_none() && response.ed25519.is_none() {
            return Err(TssError::KeyShareNotFound);
        }
        Ok(response)
    }

    /// Per-curve status; a share that no longer opens is reported, not hidden
    pub async fn check(&self, identity: &Identity) -> Result<CheckResponse> {
        let user_id = self
            .store
            .find_user(&identity.auth_type, &identity.user_identifier)
            .await?;

        let Some(user_id) = user_id else {
            return Ok(CheckResponse {
                secp256k1: NodeWalletStatus::NotRegistered,
                ed25519: NodeWalletStatus::NotRegistered,
            });
        };

        let secp = match self.record(user_id, CurveType::Secp256k1).await? {
            None => NodeWalletStatus::NotRegistered,
            Some(record) if self.open_secp(&record).is_ok() => NodeWalletStatus::Active,
            Some(_) => NodeWalletStatus::UnrecoverableDataLoss,
        };
        let ed = match self.record(user_id, CurveType::Ed25519).await? {
            None => NodeWalletStatus::NotRegistered,
            Some(record) if self.open_ed25519(&record).is_ok() => NodeWalletStatus::Active,
            Some(_) => NodeWalletStatus::UnrecoverableDataLoss,
        };

        Ok(CheckResponse {
            secp256k1: secp,
            ed25519: ed,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn parse_secp(&self, public_key: &str, share: &str) -> Result<SharePoint> {
        decode_public_key(CurveType::Secp256k1, public_key)?;
        let point = SharePoint::from_hex(share).map_err(TssError::ShareInvalid)?;
        if point.x != self.engine.share_x(CurveType::Secp256k1, &self.node_name)? {
            return Err(TssError::ShareInvalid("share x does not belong to this node".to_string()));
        }
        Ok(point)
    }

    fn parse_ed25519(&self, public_key: &str, identifier: &str, signing_share: &str) -> Result<TeddsaKeyShare> {
        decode_public_key(CurveType::Ed25519, public_key)?;
        let identifier: [u8; 32] =
            decode_fixed(identifier).map_err(|e| TssError::ShareInvalid(format!("identifier: {}", e)))?;
        let signing_share: [u8; 32] =
            decode_fixed(signing_share).map_err(|e| TssError::ShareInvalid(format!("signing_share: {}", e)))?;

        if identifier != self.engine.share_x(CurveType::Ed25519, &self.node_name)? {
            return Err(TssError::ShareInvalid(
                "identifier does not belong to this node".to_string(),
            ));
        }
        // rejects non-canonical scalars
        self.engine
            .scalar_base_mult(CurveType::Ed25519, &signing_share)
            .map_err(|e| TssError::ShareInvalid(e.to_string()))?;

        Ok(TeddsaKeyShare {
            identifier,
            signing_share,
        })
    }

    async fn insert(&self, identity: &Identity, curve: CurveType, public_key: &str, enc_share: String) -> Result<RegisterResponse> {
        let user_id = self
            .store
            .get_or_create_user(&identity.auth_type, &identity.user_identifier)
            .await?;

        let record = KeyShareRecord {
            share_id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            curve_type: curve,
            public_key: normalize_hex(public_key),
            enc_share,
            status: WALLET_STATUS_ACTIVE.to_string(),
            created_at: Utc::now(),
            reshared_at: None,
        };

        match self.store.insert_key_share(user_id, &record).await {
            Ok(()) => Ok(RegisterResponse {
                share_id: record.share_id,
            }),
            Err(StorageError::Duplicate(what)) => Err(TssError::WalletAlreadyExists(what)),
            Err(other) => Err(other.into()),
        }
    }

    pub async fn register_secp256k1(&self, identity: &Identity, public_key: &str, share: &str) -> Result<RegisterResponse> {
        let point = self.parse_secp(public_key, share)?;
        let sealed = self.cipher.seal(&point.to_bytes()).map_err(sealed_err)?;
        self.insert(identity, CurveType::Secp256k1, public_key, sealed).await
    }

    pub async fn register_ed25519(
        &self,
        identity: &Identity,
        public_key: &str,
        identifier: &str,
        signing_share: &str,
    ) -> Result<RegisterResponse> {
        let share = self.parse_ed25519(public_key, identifier, signing_share)?;
        let sealed = self.cipher.seal_json(&share).map_err(sealed_err)?;
        self.insert(identity, CurveType::Ed25519, public_key, sealed).await
    }

    /// Accept a reshare only when every submitted share equals the stored one
    pub async fn reshare(
        &self,
        identity: &Identity,
        secp256k1: Option<&SecpShareEntry>,
        ed25519: Option<&Ed25519ShareEntry>,
    ) -> Result<ReshareResponse> {
        if secp256k1.is_none() && ed25519.is_none() {
            return Err(TssError::InvalidRequest("no share to reshare".to_string()));
        }
        let user_id = self.user(identity).await?;
        let mut confirmed = Vec::new();

        if let Some(entry) = secp256k1 {
            let record = self
                .record(user_id, CurveType::Secp256k1)
                .await?
                .ok_or(TssError::KeyShareNotFound)?;
            let submitted = self.parse_secp(&entry.public_key, &entry.share)?;
            let stored = self.open_secp(&record)?;
            if record.public_key != normalize_hex(&entry.public_key) || normalize_hex(&stored.share) != submitted.to_hex() {
                return Err(TssError::ReshareFailed("secp256k1 share does not match".to_string()));
            }
            confirmed.push(record.share_id);
        }

        if let Some(entry) = ed25519 {
            let record = self
                .record(user_id, CurveType::Ed25519)
                .await?
                .ok_or(TssError::KeyShareNotFound)?;
            let submitted = self.parse_ed25519(&entry.public_key, &entry.identifier, &entry.signing_share)?;
            let stored: TeddsaKeyShare = self.cipher.open_json(&record.enc_share).map_err(sealed_err)?;
            if record.public_key != normalize_hex(&entry.public_key) || stored != submitted {
                return Err(TssError::ReshareFailed("ed25519 share does not match".to_string()));
            }
            confirmed.push(record.share_id);
        }

        let reshared_at = Utc::now();
        for share_id in confirmed {
            self.store.mark_reshared(share_id, reshared_at).await?;
        }
        Ok(ReshareResponse { reshared_at })
    }
}
