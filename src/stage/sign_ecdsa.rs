//! SIGN_ECDSA stage, run inside a session whose triples are complete

use super::{request_bytes, StageData, StageMachine};
use crate::crypto::software::decode_public_key;
use crate::error::{Result, TssError};
use crate::logging::log_protocol_event;
use crate::storage::StorageError;
use crate::types::{
    CurveType, EcdsaAggregateRequest, EcdsaAggregateResponse, EcdsaRound1Request, EcdsaRound1Response,
    EcdsaRound2Request, EcdsaRound2Response, StageStatus, StageType,
};

impl StageMachine {
    /// Round 1: presign from the session's triples and the server key share
    pub async fn ecdsa_round1(&self, request: &EcdsaRound1Request) -> Result<EcdsaRound1Response> {
        let (wallet, session) = self
            .owned_session(&request.email, request.wallet_id, request.session_id)
            .await?;
        Self::require_curve(&wallet, CurveType::Secp256k1)?;

        let triples = match self
            .load_stage(session.session_id, StageType::Triples, StageStatus::Completed)
            .await?
        {
            StageData::Triples { output: Some(output), .. } => output,
            _ => return Err(TssError::InvalidTssStage("triples output missing".to_string())),
        };

        let key_share = self.open_secp_share(&wallet)?;
        let (presign, outgoing) = self.engine.ecdsa_presign(&triples, &key_share)?;

        let stage = self.new_stage(
            session.session_id,
            StageStatus::Round1,
            &StageData::SignEcdsa {
                presign,
                share: None,
                signature: None,
            },
        )?;
        match self.store.insert_stage(&stage).await {
            Ok(()) => {}
            // one signature per triples session
            Err(StorageError::Duplicate(_)) => {
                return Err(TssError::InvalidTssSession(format!(
                    "session {} already signed",
                    session.session_id
                )))
            }
            Err(other) => return Err(other.into()),
        }

        log_protocol_event(
            StageType::SignEcdsa.as_str(),
            &StageStatus::Round1.to_string(),
            &session.session_id.to_string(),
        );
        Ok(EcdsaRound1Response {
            session_id: session.session_id,
            presign: outgoing,
        })
    }

    /// Round 2: server signature share over `msg_hash`
    pub async fn ecdsa_round2(&self, request: &EcdsaRound2Request) -> Result<EcdsaRound2Response> {
        let msg_hash: [u8; 32] = request_bytes(&request.msg_hash, "msg_hash")?;
        let (_, session) = self
            .owned_session(&request.email, request.wallet_id, request.session_id)
            .await?;

        let presign = match self
            .load_stage(session.session_id, StageType::SignEcdsa, StageStatus::Round1)
            .await?
        {
            StageData::SignEcdsa { presign, .. } => presign,
            _ => return Err(TssError::InvalidTssStage("sign stage holds foreign data".to_string())),
        };

        let share = self.engine.ecdsa_sign_share(&presign, &request.presign, &msg_hash)?;
        let response = EcdsaRound2Response {
            session_id: session.session_id,
            big_r: share.big_r.clone(),
            s_share: share.s.clone(),
        };

        self.advance(
            session.session_id,
            StageStatus::Round1,
            StageStatus::Round2,
            &StageData::SignEcdsa {
                presign,
                share: Some(share),
                signature: None,
            },
        )
        .await?;
        Ok(response)
    }

    /// Aggregate: add the client's share and verify against the wallet key
    pub async fn ecdsa_aggregate(&self, request: &EcdsaAggregateRequest) -> Result<EcdsaAggregateResponse> {
        let peer_s: [u8; 32] = request_bytes(&request.s_share, "s_share")?;
        let (wallet, session) = self
            .owned_session(&request.email, request.wallet_id, request.session_id)
            .await?;

        let (presign, share) = match self
            .load_stage(session.session_id, StageType::SignEcdsa, StageStatus::Round2)
            .await?
        {
            StageData::SignEcdsa {
                presign,
                share: Some(share),
                ..
            } => (presign, share),
            _ => return Err(TssError::InvalidTssStage("signature share missing".to_string())),
        };

        let public_key = decode_public_key(CurveType::Secp256k1, &wallet.public_key)?;
        let signature = self.engine.ecdsa_aggregate(&share, &peer_s, &public_key)?;
        let response = EcdsaAggregateResponse {
            session_id: session.session_id,
            r: signature.r.clone(),
            s: signature.s.clone(),
            v: signature.v,
        };

        self.advance(
            session.session_id,
            StageStatus::Round2,
            StageStatus::Completed,
            &StageData::SignEcdsa {
                presign,
                share: Some(share),
                signature: Some(signature),
            },
        )
        .await?;
        Ok(response)
    }
}
