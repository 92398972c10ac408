//! SIGN_EDDSA stage: FROST 2-of-2, one session per signature

use super::{StageData, StageMachine};
use crate::crypto::CryptoError;
use crate::error::{Result, TssError};
use crate::logging::log_protocol_event;
use crate::types::{
    CurveType, EddsaAggregateRequest, EddsaAggregateResponse, EddsaRound1Request, EddsaRound1Response,
    EddsaRound2Request, EddsaRound2Response, StageStatus, StageType,
};

/// FROST rejects malformed client commitments or shares with its own error type
fn client_input(err: CryptoError) -> TssError {
    match err {
        CryptoError::Frost(msg) => TssError::InvalidRequest(msg),
        other => other.into(),
    }
}

fn decode_message(value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| TssError::InvalidRequest(format!("message: invalid hex: {}", e)))
}

impl StageMachine {
    /// Round 1: open the session, store nonces, return server commitments
    pub async fn eddsa_round1(&self, request: &EddsaRound1Request) -> Result<EddsaRound1Response> {
        let message = decode_message(&request.message)?;
        let (_, wallet) = self.owned_wallet(&request.email, request.wallet_id).await?;
        Self::require_curve(&wallet, CurveType::Ed25519)?;

        let material = self.open_frost_material(&wallet)?;
        let round1 = self.engine.frost_commit(&material)?;
        let response_commitments = round1.commitments.clone();

        let session = Self::new_session(wallet.wallet_id, request.customer_id.clone());
        let stage = self.new_stage(
            session.session_id,
            StageStatus::Round1,
            &StageData::SignEddsa {
                message: hex::encode(message),
                round1,
                client_commitments: None,
                signature_share: None,
                signature: None,
            },
        )?;
        self.store.create_session(&session, &stage).await?;

        log_protocol_event(
            StageType::SignEddsa.as_str(),
            &StageStatus::Round1.to_string(),
            &session.session_id.to_string(),
        );
        Ok(EddsaRound1Response {
            session_id: session.session_id,
            identifier: material.identifier,
            commitments: response_commitments,
        })
    }

    /// Round 2: server signature share; the stored nonces are used once
    pub async fn eddsa_round2(&self, request: &EddsaRound2Request) -> Result<EddsaRound2Response> {
        let (wallet, session) = self
            .owned_session(&request.email, request.wallet_id, request.session_id)
            .await?;

        let (message, round1) = match self
            .load_stage(session.session_id, StageType::SignEddsa, StageStatus::Round1)
            .await?
        {
            StageData::SignEddsa { message, round1, .. } => (message, round1),
            _ => return Err(TssError::InvalidTssStage("sign stage holds foreign data".to_string())),
        };

        let material = self.open_frost_material(&wallet)?;
        let share = self
            .engine
            .frost_sign_share(&material, &round1, &request.client_commitments, &decode_message(&message)?)
            .map_err(client_input)?;

        self.advance(
            session.session_id,
            StageStatus::Round1,
            StageStatus::Round2,
            &StageData::SignEddsa {
                message,
                round1,
                client_commitments: Some(request.client_commitments.clone()),
                signature_share: Some(share.clone()),
                signature: None,
            },
        )
        .await?;

        Ok(EddsaRound2Response {
            session_id: session.session_id,
            signature_share: share,
        })
    }

    /// Aggregate both shares and verify under the group key
    pub async fn eddsa_aggregate(&self, request: &EddsaAggregateRequest) -> Result<EddsaAggregateResponse> {
        let (wallet, session) = self
            .owned_session(&request.email, request.wallet_id, request.session_id)
            .await?;

        let (message, round1, client_commitments, server_share) = match self
            .load_stage(session.session_id, StageType::SignEddsa, StageStatus::Round2)
            .await?
        {
            StageData::SignEddsa {
                message,
                round1,
                client_commitments: Some(commitments),
                signature_share: Some(share),
                ..
            } => (message, round1, commitments, share),
            _ => return Err(TssError::InvalidTssStage("round 2 output missing".to_string())),
        };

        let material = self.open_frost_material(&wallet)?;
        let signature = self
            .engine
            .frost_aggregate(
                &material,
                &round1,
                &client_commitments,
                &decode_message(&message)?,
                &server_share,
                &request.client_signature_share,
            )
            .map_err(client_input)?;

        self.advance(
            session.session_id,
            StageStatus::Round2,
            StageStatus::Completed,
            &StageData::SignEddsa {
                message,
                round1,
                client_commitments: Some(client_commitments),
                signature_share: Some(server_share),
                signature: Some(signature.clone()),
            },
        )
        .await?;

        Ok(EddsaAggregateResponse {
            session_id: session.session_id,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::frost::test_dealer::{deal, Dealt};
    use crate::stage::test_support::{machine, secp_payload};
    use crate::types::KeygenV2Request;
    use frost_ed25519 as frost;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    const EMAIL: &str = "carol@example.com";
    const MESSAGE: &[u8] = b"transfer 2 SOL";

    async fn ed_wallet(machine: &StageMachine) -> (Uuid, Dealt) {
        let (secp, _) = secp_payload();
        let dealt = deal("tss-server", "client");
        let response = machine
            .keygen_v2(&KeygenV2Request {
                email: EMAIL.to_string(),
                wallet_id: None,
                customer_id: None,
                secp256k1: secp,
                ed25519: dealt.payload.clone(),
            })
            .await
            .unwrap();
        (response.wallets[1].wallet_id, dealt)
    }

    struct ClientRound {
        session_id: Uuid,
        nonces: frost::round1::SigningNonces,
        commitments: frost::round1::SigningCommitments,
        package: frost::SigningPackage,
    }

    async fn start(machine: &StageMachine, wallet_id: Uuid, dealt: &Dealt) -> ClientRound {
        let round1 = machine
            .eddsa_round1(&EddsaRound1Request {
                email: EMAIL.to_string(),
                wallet_id,
                customer_id: None,
                message: hex::encode(MESSAGE),
            })
            .await
            .unwrap();

        let mut rng = rand::thread_rng();
        let (nonces, commitments) = frost::round1::commit(dealt.client_key_package.signing_share(), &mut rng);

        let server_id = frost::Identifier::deserialize(&hex::decode(&round1.identifier).unwrap()).unwrap();
        let server_commitments =
            frost::round1::SigningCommitments::deserialize(&hex::decode(&round1.commitments).unwrap()).unwrap();
        let mut all = BTreeMap::new();
        all.insert(server_id, server_commitments);
        all.insert(*dealt.client_key_package.identifier(), commitments);

        ClientRound {
            session_id: round1.session_id,
            nonces,
            commitments,
            package: frost::SigningPackage::new(all, MESSAGE),
        }
    }

    fn round2_request(wallet_id: Uuid, round: &ClientRound) -> EddsaRound2Request {
        EddsaRound2Request {
            email: EMAIL.to_string(),
            wallet_id,
            session_id: round.session_id,
            client_commitments: hex::encode(round.commitments.serialize().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_signature_verifies_under_group_key() {
        let machine = machine();
        let (wallet_id, dealt) = ed_wallet(&machine).await;
        let round = start(&machine, wallet_id, &dealt).await;

        machine.eddsa_round2(&round2_request(wallet_id, &round)).await.unwrap();
        let client_share = frost::round2::sign(&round.package, &round.nonces, &dealt.client_key_package).unwrap();

        let response = machine
            .eddsa_aggregate(&EddsaAggregateRequest {
                email: EMAIL.to_string(),
                wallet_id,
                session_id: round.session_id,
                client_signature_share: hex::encode(client_share.serialize()),
            })
            .await
            .unwrap();

        let signature = frost::Signature::deserialize(&hex::decode(&response.signature).unwrap()).unwrap();
        dealt
            .client_key_package
            .verifying_key()
            .verify(MESSAGE, &signature)
            .unwrap();

        let err = machine
            .eddsa_aggregate(&EddsaAggregateRequest {
                email: EMAIL.to_string(),
                wallet_id,
                session_id: round.session_id,
                client_signature_share: hex::encode(client_share.serialize()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TSS_SESSION");

        // a completed session issues no further shares
        let err = machine.eddsa_round2(&round2_request(wallet_id, &round)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TSS_SESSION");
    }

    #[tokio::test]
    async fn test_round2_twice_rejected() {
        let machine = machine();
        let (wallet_id, dealt) = ed_wallet(&machine).await;
        let round = start(&machine, wallet_id, &dealt).await;

        machine.eddsa_round2(&round2_request(wallet_id, &round)).await.unwrap();
        let err = machine.eddsa_round2(&round2_request(wallet_id, &round)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TSS_SESSION");
    }

    #[tokio::test]
    async fn test_secp_wallet_cannot_sign_eddsa() {
        let machine = machine();
        ed_wallet(&machine).await;
        let user = machine.store.get_user_by_email(EMAIL).await.unwrap().unwrap();
        let secp = machine
            .store
            .get_wallet_by_user_curve(user.user_id, CurveType::Secp256k1)
            .await
            .unwrap()
            .unwrap();

        let err = machine
            .eddsa_round1(&EddsaRound1Request {
                email: EMAIL.to_string(),
                wallet_id: secp.wallet_id,
                customer_id: None,
                message: hex::encode(MESSAGE),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_malformed_commitments_are_client_errors() {
        let machine = machine();
        let (wallet_id, dealt) = ed_wallet(&machine).await;
        let round = start(&machine, wallet_id, &dealt).await;

        let mut request = round2_request(wallet_id, &round);
        request.client_commitments = "00".repeat(8);
        let err = machine.eddsa_round2(&request).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        // the failed attempt left round 1 intact
        machine.eddsa_round2(&round2_request(wallet_id, &round)).await.unwrap();
    }
}
