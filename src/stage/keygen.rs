//! Keygen: validate the client's centralized keygen and persist the server share

use uuid::Uuid;

use super::{request_bytes, StageData, StageMachine};
use crate::crypto::software::decode_public_key;
use crate::error::{Result, TssError};
use crate::logging::log_protocol_event;
use crate::storage::{KeygenRecord, NewWallet, StorageError};
use crate::types::{
    CurveType, Ed25519KeygenPayload, KeygenRequest, KeygenResponse, KeygenV2Request, Secp256k1KeygenPayload,
    StageStatus, StageType, User, WalletSummary,
};

impl StageMachine {
    /// POST /keygen: secp256k1 only
    pub async fn keygen(&self, request: &KeygenRequest) -> Result<KeygenResponse> {
        let wallet_id = request.wallet_id.unwrap_or_else(Uuid::new_v4);
        let secp = self.secp_wallet(wallet_id, &request.secp256k1)?;
        self.persist_keygen(&request.email, request.customer_id.clone(), vec![secp])
            .await
    }

    /// POST /keygen/v2: secp256k1 and ed25519 in one transaction
    pub async fn keygen_v2(&self, request: &KeygenV2Request) -> Result<KeygenResponse> {
        let wallet_id = request.wallet_id.unwrap_or_else(Uuid::new_v4);
        let secp = self.secp_wallet(wallet_id, &request.secp256k1)?;
        let ed = self.ed25519_wallet(Uuid::new_v4(), &request.ed25519)?;
        self.persist_keygen(&request.email, request.customer_id.clone(), vec![secp, ed])
            .await
    }

    fn secp_wallet(&self, wallet_id: Uuid, payload: &Secp256k1KeygenPayload) -> Result<NewWallet> {
        self.engine.ecdsa_keygen_check(payload)?;
        let public_key = decode_public_key(CurveType::Secp256k1, &payload.public_key)?;
        let server_share: [u8; 32] = request_bytes(&payload.server_share, "server_share")?;

        Ok(NewWallet {
            wallet_id,
            curve_type: CurveType::Secp256k1,
            public_key: hex::encode(public_key),
            enc_tss_share: self.seal_secp_share(&server_share)?,
            sss_threshold: self.sss_threshold,
        })
    }

    fn ed25519_wallet(&self, wallet_id: Uuid, payload: &Ed25519KeygenPayload) -> Result<NewWallet> {
        let material = self.engine.frost_key_package(payload)?;
        let public_key = decode_public_key(CurveType::Ed25519, &material.verifying_key)?;

        Ok(NewWallet {
            wallet_id,
            curve_type: CurveType::Ed25519,
            public_key: hex::encode(public_key),
            enc_tss_share: self.seal_frost_material(&material)?,
            sss_threshold: self.sss_threshold,
        })
    }

    /// Reject keys already in use before opening the write transaction
    async fn check_unique(&self, user: Option<&User>, wallet: &NewWallet) -> Result<()> {
        if let Some(existing) = self
            .store
            .get_wallet_by_public_key(wallet.curve_type, &wallet.public_key)
            .await?
        {
            return match user {
                Some(user) if user.user_id == existing.user_id => Err(TssError::WalletAlreadyExists(
                    wallet.curve_type.to_string(),
                )),
                _ => Err(TssError::DuplicatePublicKey(wallet.public_key.clone())),
            };
        }

        if let Some(user) = user {
            if self
                .store
                .get_wallet_by_user_curve(user.user_id, wallet.curve_type)
                .await?
                .is_some()
            {
                return Err(TssError::WalletAlreadyExists(wallet.curve_type.to_string()));
            }
        }
        Ok(())
    }

    async fn persist_keygen(
        &self,
        email: &str,
        customer_id: Option<String>,
        wallets: Vec<NewWallet>,
    ) -> Result<KeygenResponse> {
        if email.trim().is_empty() {
            return Err(TssError::InvalidRequest("email is required".to_string()));
        }

        let user = self.store.get_user_by_email(email).await?;
        for wallet in &wallets {
            self.check_unique(user.as_ref(), wallet).await?;
        }

        let summaries: Vec<WalletSummary> = wallets
            .iter()
            .map(|w| WalletSummary {
                wallet_id: w.wallet_id,
                curve_type: w.curve_type,
                public_key: w.public_key.clone(),
            })
            .collect();
        let session_wallet = summaries
            .first()
            .map(|w| w.wallet_id)
            .ok_or_else(|| TssError::InvalidRequest("no wallet to create".to_string()))?;

        let session = Self::new_session(session_wallet, customer_id);
        let stage = self.new_stage(
            session.session_id,
            StageStatus::Completed,
            &StageData::Keygen {
                wallets: summaries.clone(),
            },
        )?;
        let session_id = session.session_id;

        let record = KeygenRecord {
            email: email.to_string(),
            wallets,
            session,
            stage,
        };
        match self.store.create_keygen(&record).await {
            Ok(_) => {}
            // a concurrent keygen took the key between the check and the insert
            Err(StorageError::Duplicate(msg)) => return Err(TssError::DuplicatePublicKey(msg)),
            Err(other) => return Err(other.into()),
        }

        log_protocol_event(StageType::Keygen.as_str(), "COMPLETED", &session_id.to_string());
        tracing::info!(
            session_id = %session_id,
            wallets = summaries.len(),
            "Keygen stored"
        );

        Ok(KeygenResponse {
            session_id,
            wallets: summaries,
        })
    }
}
