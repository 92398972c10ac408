//! Triples stage: eleven request/response steps ending in a `pub_v` agreement

use super::{StageData, StageMachine};
use crate::crypto::TriplesMessage;
use crate::error::{Result, TssError};
use crate::logging::log_protocol_event;
use crate::types::{CurveType, StageStatus, StageType, TriplesRequest, TriplesResponse};

pub const FIRST_STEP: u8 = 1;
pub const LAST_STEP: u8 = 11;

impl StageMachine {
    /// Run triples step `step` (1..=11) for the server party
    pub async fn triples_step(&self, step: u8, request: &TriplesRequest) -> Result<TriplesResponse> {
        match step {
            FIRST_STEP => self.triples_start(request).await,
            LAST_STEP => self.triples_finish(request).await,
            2..=10 => self.triples_exchange(step, request).await,
            other => Err(TssError::InvalidRequest(format!("no triples step {}", other))),
        }
    }

    async fn triples_start(&self, request: &TriplesRequest) -> Result<TriplesResponse> {
        let (_, wallet) = self.owned_wallet(&request.email, request.wallet_id).await?;
        Self::require_curve(&wallet, CurveType::Secp256k1)?;

        let (party, outgoing) = self.engine.triples_step(FIRST_STEP, None, None)?;
        let session = Self::new_session(wallet.wallet_id, request.customer_id.clone());
        let status = StageStatus::Step(FIRST_STEP);
        let stage = self.new_stage(session.session_id, status, &StageData::Triples { party, output: None })?;
        self.store.create_session(&session, &stage).await?;

        log_protocol_event(StageType::Triples.as_str(), &status.to_string(), &session.session_id.to_string());
        Ok(TriplesResponse {
            session_id: session.session_id,
            status: status.to_string(),
            message: Some(outgoing),
            public: None,
        })
    }

    async fn triples_exchange(&self, step: u8, request: &TriplesRequest) -> Result<TriplesResponse> {
        let session_id = request
            .session_id
            .ok_or_else(|| TssError::InvalidRequest("session_id is required".to_string()))?;
        let incoming = request
            .message
            .as_ref()
            .ok_or_else(|| TssError::InvalidRequest(format!("step {} requires a client message", step)))?;
        self.owned_session(&request.email, request.wallet_id, session_id).await?;

        let expected = StageStatus::Step(step - 1);
        let party = match self.load_stage(session_id, StageType::Triples, expected).await? {
            StageData::Triples { party, .. } => party,
            _ => return Err(TssError::InvalidTssStage("triples stage holds foreign data".to_string())),
        };

        let (party, outgoing) = self.engine.triples_step(step, Some(&party), Some(incoming))?;
        let next = StageStatus::Step(step);
        self.advance(session_id, expected, next, &StageData::Triples { party, output: None })
            .await?;

        Ok(TriplesResponse {
            session_id,
            status: next.to_string(),
            message: Some(outgoing),
            public: None,
        })
    }

    async fn triples_finish(&self, request: &TriplesRequest) -> Result<TriplesResponse> {
        let session_id = request
            .session_id
            .ok_or_else(|| TssError::InvalidRequest("session_id is required".to_string()))?;
        let claimed = match &request.message {
            Some(TriplesMessage::PublicView { public }) => public,
            _ => return Err(TssError::InvalidRequest("step 11 requires the client's public view".to_string())),
        };
        self.owned_session(&request.email, request.wallet_id, session_id).await?;

        let expected = StageStatus::Step(LAST_STEP - 1);
        let party = match self.load_stage(session_id, StageType::Triples, expected).await? {
            StageData::Triples { party, .. } => party,
            _ => return Err(TssError::InvalidTssStage("triples stage holds foreign data".to_string())),
        };

        let public = self.engine.triples_public(&party)?;
        if &public != claimed {
            tracing::warn!(session_id = %session_id, "Client triples view does not match server view");
            return Err(TssError::InvalidTssTriplesResult("public view mismatch".to_string()));
        }

        let output = self.engine.triples_output(&party)?;
        self.advance(
            session_id,
            expected,
            StageStatus::Completed,
            &StageData::Triples {
                party,
                output: Some(output),
            },
        )
        .await?;

        Ok(TriplesResponse {
            session_id,
            status: StageStatus::Completed.to_string(),
            message: None,
            public: Some(public),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_flow {
    use super::*;
    use crate::crypto::{TriplesParty, CLIENT_PARTY, SERVER_PARTY};
    use uuid::Uuid;

    pub fn request(email: &str, wallet_id: Uuid, session_id: Option<Uuid>, message: Option<TriplesMessage>) -> TriplesRequest {
        TriplesRequest {
            email: email.to_string(),
            wallet_id,
            customer_id: None,
            session_id,
            message,
        }
    }

    /// Drive steps 1..=10 as the client; returns the session and client party
    pub async fn run_to_step_10(machine: &StageMachine, email: &str, wallet_id: Uuid) -> (Uuid, TriplesParty) {
        let mut client = TriplesParty::new(CLIENT_PARTY, SERVER_PARTY);
        let first = machine.triples_step(1, &request(email, wallet_id, None, None)).await.unwrap();
        let session_id = first.session_id;
        let mut from_server = first.message.unwrap();

        for step in 2..=10u8 {
            let index = usize::from(step) - 2;
            client.receive(index, &from_server).unwrap();
            let outgoing = client.emit(index).unwrap();
            let response = machine
                .triples_step(step, &request(email, wallet_id, Some(session_id), Some(outgoing)))
                .await
                .unwrap();
            assert_eq!(response.status, format!("STEP_{}", step));
            from_server = response.message.unwrap();
        }
        // server's confirm (index 9) is informational for the client
        client.receive(9, &from_server).unwrap();
        (session_id, client)
    }

    /// Complete a triples session and return the client's output
    pub async fn completed(machine: &StageMachine, email: &str, wallet_id: Uuid) -> (Uuid, crate::crypto::TriplesOutput) {
        let (session_id, client) = run_to_step_10(machine, email, wallet_id).await;
        let public = client.public_view().unwrap();
        let response = machine
            .triples_step(
                11,
                &request(email, wallet_id, Some(session_id), Some(TriplesMessage::PublicView { public })),
            )
            .await
            .unwrap();
        assert_eq!(response.status, "COMPLETED");
        (session_id, client.output().unwrap())
    }
}
