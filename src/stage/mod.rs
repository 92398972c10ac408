//! Session/stage machines for the TSS protocols
//!
//! Every round follows the same path:
//!
//! 1. resolve the caller's user by email and check wallet ownership
//! 2. load the stage and require the status the round starts from
//! 3. run the `CryptoEngine` transition
//! 4. compare-and-swap the stage to its next status with the new data
//!
//! Losing step 4 to a concurrent call for the same round is reported the same
//! way as a replay: `INVALID_TSS_SESSION`.

mod keygen;
mod sign_ecdsa;
mod sign_eddsa;
pub(crate) mod triples;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{
    CryptoEngine, EcdsaPresignState, EcdsaShare, EcdsaSignature, FrostKeyMaterial, FrostRound1, TriplesOutput,
    TriplesParty,
};
use crate::error::{Result, TssError};
use crate::logging::log_protocol_event;
use crate::share_cipher::{CipherError, ShareCipher};
use crate::storage::{StorageError, TssStore};
use crate::types::{decode_fixed, CurveType, StageStatus, StageType, TssSession, TssStage, User, Wallet, WalletSummary};

/// Domain tag for server key shares sealed into `enc_tss_share`
pub const TSS_SHARE_DOMAIN: &str = "tss-share-v1";
/// Domain tag for sealed `stage_data`
pub const TSS_STAGE_DOMAIN: &str = "tss-stage-v1";

/// Per-stage protocol state, replaced wholesale on every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageData {
    Triples {
        party: TriplesParty,
        #[serde(default)]
        output: Option<TriplesOutput>,
    },
    Keygen {
        wallets: Vec<WalletSummary>,
    },
    SignEcdsa {
        presign: EcdsaPresignState,
        #[serde(default)]
        share: Option<EcdsaShare>,
        #[serde(default)]
        signature: Option<EcdsaSignature>,
    },
    SignEddsa {
        /// Hex message being signed
        message: String,
        round1: FrostRound1,
        #[serde(default)]
        client_commitments: Option<String>,
        #[serde(default)]
        signature_share: Option<String>,
        #[serde(default)]
        signature: Option<String>,
    },
}

impl StageData {
    pub fn stage_type(&self) -> StageType {
        match self {
            StageData::Triples { .. } => StageType::Triples,
            StageData::Keygen { .. } => StageType::Keygen,
            StageData::SignEcdsa { .. } => StageType::SignEcdsa,
            StageData::SignEddsa { .. } => StageType::SignEddsa,
        }
    }
}

fn cipher_err(err: CipherError) -> TssError {
    TssError::unknown(format!("cipher: {}", err))
}

pub struct StageMachine {
    store: Arc<dyn TssStore>,
    engine: Arc<dyn CryptoEngine>,
    share_cipher: ShareCipher,
    stage_cipher: ShareCipher,
    sss_threshold: u16,
}

impl StageMachine {
    pub fn new(
        store: Arc<dyn TssStore>,
        engine: Arc<dyn CryptoEngine>,
        share_password: impl Into<String>,
        sss_threshold: u16,
    ) -> Self {
        let password = share_password.into();
        Self {
            store,
            engine,
            share_cipher: ShareCipher::new(password.clone(), TSS_SHARE_DOMAIN),
            stage_cipher: ShareCipher::new(password, TSS_STAGE_DOMAIN),
            sss_threshold,
        }
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    async fn owned_wallet(&self, email: &str, wallet_id: Uuid) -> Result<(User, Wallet)> {
        let user = self
            .store
            .get_user_by_email(email)
            .await?
            .ok_or(TssError::UserNotFound)?;
        let wallet = self
            .store
            .get_wallet(wallet_id)
            .await?
            .ok_or(TssError::WalletNotFound)?;
        if wallet.user_id != user.user_id {
            return Err(TssError::Unauthorized("wallet does not belong to user".to_string()));
        }
        Ok((user, wallet))
    }

    async fn owned_session(&self, email: &str, wallet_id: Uuid, session_id: Uuid) -> Result<(Wallet, TssSession)> {
        let (_, wallet) = self.owned_wallet(email, wallet_id).await?;
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| TssError::InvalidTssSession(format!("unknown session {}", session_id)))?;
        if session.wallet_id != wallet.wallet_id {
            return Err(TssError::Unauthorized("session does not belong to wallet".to_string()));
        }
        Ok((wallet, session))
    }

    fn require_curve(wallet: &Wallet, curve: CurveType) -> Result<()> {
        if wallet.curve_type != curve {
            return Err(TssError::InvalidRequest(format!(
                "wallet {} is {}, not {}",
                wallet.wallet_id, wallet.curve_type, curve
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Key shares at rest
    // =========================================================================

    fn seal_secp_share(&self, share: &[u8; 32]) -> Result<String> {
        self.share_cipher.seal(share).map_err(cipher_err)
    }

    fn open_secp_share(&self, wallet: &Wallet) -> Result<[u8; 32]> {
        let raw = self.share_cipher.open(&wallet.enc_tss_share).map_err(cipher_err)?;
        raw.try_into()
            .map_err(|_| TssError::unknown(format!("wallet {} share is not 32 bytes", wallet.wallet_id)))
    }

    fn seal_frost_material(&self, material: &FrostKeyMaterial) -> Result<String> {
        self.share_cipher.seal_json(material).map_err(cipher_err)
    }

    fn open_frost_material(&self, wallet: &Wallet) -> Result<FrostKeyMaterial> {
        self.share_cipher.open_json(&wallet.enc_tss_share).map_err(cipher_err)
    }

    // =========================================================================
    // Stages
    // =========================================================================

    fn new_stage(&self, session_id: Uuid, status: StageStatus, data: &StageData) -> Result<TssStage> {
        Ok(TssStage {
            stage_id: Uuid::new_v4(),
            session_id,
            stage_type: data.stage_type(),
            stage_status: status,
            stage_data: self.stage_cipher.seal_json(data).map_err(cipher_err)?,
        })
    }

    fn new_session(wallet_id: Uuid, customer_id: Option<String>) -> TssSession {
        TssSession {
            session_id: Uuid::new_v4(),
            wallet_id,
            customer_id,
            created_at: Utc::now(),
        }
    }

    /// Load a stage that must currently be at `expected`
    async fn load_stage(&self, session_id: Uuid, stage_type: StageType, expected: StageStatus) -> Result<StageData> {
        let stage = self
            .store
            .get_stage(session_id, stage_type)
            .await?
            .ok_or_else(|| TssError::InvalidTssStage(format!("no {} stage in session {}", stage_type, session_id)))?;

        if stage.stage_status != expected {
            return Err(TssError::InvalidTssSession(format!(
                "{} stage is {}, expected {}",
                stage_type, stage.stage_status, expected
            )));
        }

        let data: StageData = self.stage_cipher.open_json(&stage.stage_data).map_err(cipher_err)?;
        if data.stage_type() != stage_type {
            return Err(TssError::InvalidTssStage(format!(
                "{} stage holds {} data",
                stage_type,
                data.stage_type()
            )));
        }
        Ok(data)
    }

    /// Compare-and-swap `expected -> next`
    async fn advance(&self, session_id: Uuid, expected: StageStatus, next: StageStatus, data: &StageData) -> Result<()> {
        let stage_type = data.stage_type();
        let sealed = self.stage_cipher.seal_json(data).map_err(cipher_err)?;

        match self
            .store
            .transition_stage(session_id, stage_type, expected, next, &sealed)
            .await
        {
            Ok(()) => {
                log_protocol_event(stage_type.as_str(), &next.to_string(), &session_id.to_string());
                Ok(())
            }
            Err(StorageError::Conflict(msg)) => Err(TssError::InvalidTssSession(msg)),
            Err(other) => Err(other.into()),
        }
    }
}

/// Hex argument of an exact width, reported as `INVALID_REQUEST`
fn request_bytes<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    decode_fixed(value).map_err(|e| TssError::InvalidRequest(format!("{}: {}", what, e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::secp::{encode_point, encode_scalar, random_scalar};
    use crate::crypto::SoftwareEngine;
    use crate::storage::SqliteTssStore;
    use crate::types::{KeygenRequest, Secp256k1KeygenPayload};
    use k256::{ProjectivePoint, Scalar};
    use rand::rngs::OsRng;

    pub fn machine() -> StageMachine {
        StageMachine::new(
            Arc::new(SqliteTssStore::in_memory().unwrap()),
            Arc::new(SoftwareEngine::new()),
            "test-password",
            2,
        )
    }

    pub struct SecpWallet {
        pub wallet_id: Uuid,
        pub client_share: Scalar,
        pub public_key: String,
    }

    pub fn secp_payload() -> (Secp256k1KeygenPayload, Scalar) {
        let x_s = random_scalar(&mut OsRng);
        let x_c = random_scalar(&mut OsRng);
        let payload = Secp256k1KeygenPayload {
            public_key: encode_point(&(ProjectivePoint::GENERATOR * (x_s + x_c))),
            client_public_share: encode_point(&(ProjectivePoint::GENERATOR * x_c)),
            server_share: encode_scalar(&x_s),
        };
        (payload, x_c)
    }

    pub async fn secp_wallet(machine: &StageMachine, email: &str) -> SecpWallet {
        let (payload, client_share) = secp_payload();
        let public_key = payload.public_key.clone();
        let response = machine
            .keygen(&KeygenRequest {
                email: email.to_string(),
                wallet_id: None,
                customer_id: None,
                secp256k1: payload,
            })
            .await
            .unwrap();
        SecpWallet {
            wallet_id: response.wallets[0].wallet_id,
            client_share,
            public_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{machine, secp_wallet};
    use super::*;

    #[tokio::test]
    async fn test_ownership_errors() {
        let machine = machine();
        let alice = secp_wallet(&machine, "alice@example.com").await;
        let bob = secp_wallet(&machine, "bob@example.com").await;

        let err = machine.owned_wallet("nobody@example.com", alice.wallet_id).await.unwrap_err();
        assert_eq!(err.code(), "USER_NOT_FOUND");

        let err = machine.owned_wallet("alice@example.com", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "WALLET_NOT_FOUND");

        let err = machine.owned_wallet("alice@example.com", bob.wallet_id).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        let err = machine
            .owned_session("alice@example.com", alice.wallet_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TSS_SESSION");
    }

    #[test]
    fn test_stage_data_tag() {
        let data = StageData::Keygen { wallets: Vec::new() };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "KEYGEN");
        assert_eq!(data.stage_type(), StageType::Keygen);
    }
}
