//! In-process `CryptoEngine` on k256, curve25519-dalek and frost-ed25519
//!
//! Triple multiplication opens the `b` shares (see `triples`), so this engine
//! is for development and tests. `TssConfig::validate_for_production`
//! refuses it.

use ff::PrimeField;
use k256::ProjectivePoint;
use sha2::{Digest, Sha256};

use super::{ecdsa, frost, secp, shamir, triples};
use super::{
    CryptoEngine, CryptoError, EcdsaPresignMessage, EcdsaPresignState, EcdsaShare, EcdsaSignature,
    FrostKeyMaterial, FrostRound1, RawPoint, TriplesMessage, TriplesOutput, TriplesParty,
    TriplesPublic, CLIENT_PARTY, SERVER_PARTY,
};
use crate::types::{decode_fixed, CurveType, Ed25519KeygenPayload, Secp256k1KeygenPayload};

#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareEngine;

impl SoftwareEngine {
    pub fn new() -> Self {
        Self
    }
}

fn to_points<F: PrimeField>(raw: &[RawPoint]) -> Result<Vec<(F, F)>, CryptoError> {
    raw.iter()
        .map(|(x, y)| Ok((shamir::from_bytes::<F>(x)?, shamir::from_bytes::<F>(y)?)))
        .collect()
}

fn to_scalars<F: PrimeField>(raw: &[[u8; 32]]) -> Result<Vec<F>, CryptoError> {
    raw.iter().map(shamir::from_bytes::<F>).collect()
}

fn split_in<F: PrimeField>(secret: &[u8; 32], xs: &[[u8; 32]], threshold: usize) -> Result<Vec<[u8; 32]>, CryptoError> {
    let secret = shamir::from_bytes::<F>(secret)?;
    let xs = to_scalars::<F>(xs)?;
    let ys = shamir::split(secret, &xs, threshold, &mut rand::thread_rng())?;
    Ok(ys.iter().map(shamir::to_bytes).collect())
}

fn combine_in<F: PrimeField>(points: &[RawPoint], threshold: usize) -> Result<[u8; 32], CryptoError> {
    let points = to_points::<F>(points)?;
    Ok(shamir::to_bytes(&shamir::combine(&points, threshold)?))
}

fn expand_in<F: PrimeField>(
    existing: &[RawPoint],
    new_xs: &[[u8; 32]],
    threshold: usize,
) -> Result<(Vec<[u8; 32]>, [u8; 32]), CryptoError> {
    let existing = to_points::<F>(existing)?;
    let new_xs = to_scalars::<F>(new_xs)?;
    let (ys, secret) = shamir::expand(&existing, &new_xs, threshold)?;
    Ok((ys.iter().map(shamir::to_bytes).collect(), shamir::to_bytes(&secret)))
}

impl CryptoEngine for SoftwareEngine {
    fn name(&self) -> &'static str {
        "software"
    }

    fn triples_step(
        &self,
        step: u8,
        state: Option<&TriplesParty>,
        incoming: Option<&TriplesMessage>,
    ) -> Result<(TriplesParty, TriplesMessage), CryptoError> {
        match (step, state, incoming) {
            (1, None, None) => {
                let mut party = TriplesParty::new(SERVER_PARTY, CLIENT_PARTY);
                let outgoing = party.emit(0)?;
                Ok((party, outgoing))
            }
            (2..=10, Some(state), Some(incoming)) => {
                let mut party = state.clone();
                let index = usize::from(step);
                party.receive(index - 2, incoming)?;
                let outgoing = party.emit(index - 1)?;
                Ok((party, outgoing))
            }
            (1, ..) => Err(CryptoError::InvalidMessage("step 1 takes no input".to_string())),
            (2..=10, ..) => Err(CryptoError::InvalidMessage(format!("step {} requires a client message", step))),
            _ => Err(CryptoError::InvalidMessage(format!(
                "step {} is outside 1..={}",
                step,
                triples::MESSAGE_COUNT
            ))),
        }
    }

    fn triples_public(&self, state: &TriplesParty) -> Result<TriplesPublic, CryptoError> {
        state.public_view()
    }

    fn triples_output(&self, state: &TriplesParty) -> Result<TriplesOutput, CryptoError> {
        state.output()
    }

    fn ecdsa_keygen_check(&self, payload: &Secp256k1KeygenPayload) -> Result<(), CryptoError> {
        let public_key = secp::decode_point(&payload.public_key)?;
        let client_share = secp::decode_point(&payload.client_public_share)?;
        let server_share = secp::decode_scalar(&payload.server_share)?;

        if ProjectivePoint::GENERATOR * server_share + client_share != public_key {
            return Err(CryptoError::InvalidPoint(
                "shares do not add up to the public key".to_string(),
            ));
        }
        Ok(())
    }

    fn ecdsa_presign(
        &self,
        triples: &TriplesOutput,
        key_share: &[u8; 32],
    ) -> Result<(EcdsaPresignState, EcdsaPresignMessage), CryptoError> {
        ecdsa::presign(triples, &secp::scalar_from_bytes(key_share)?)
    }

    fn ecdsa_sign_share(
        &self,
        state: &EcdsaPresignState,
        peer: &EcdsaPresignMessage,
        msg_hash: &[u8; 32],
    ) -> Result<EcdsaShare, CryptoError> {
        ecdsa::sign_share(state, peer, msg_hash)
    }

    fn ecdsa_aggregate(
        &self,
        own: &EcdsaShare,
        peer_s: &[u8; 32],
        public_key: &[u8],
    ) -> Result<EcdsaSignature, CryptoError> {
        ecdsa::aggregate(own, &secp::scalar_from_bytes(peer_s)?, public_key)
    }

    fn ecdsa_verify(
        &self,
        public_key: &[u8],
        msg_hash: &[u8; 32],
        signature: &EcdsaSignature,
    ) -> Result<(), CryptoError> {
        ecdsa::verify(public_key, msg_hash, signature)
    }

    fn frost_key_package(&self, payload: &Ed25519KeygenPayload) -> Result<FrostKeyMaterial, CryptoError> {
        frost::key_material(payload)
    }

    fn frost_commit(&self, material: &FrostKeyMaterial) -> Result<FrostRound1, CryptoError> {
        frost::commit(material)
    }

    fn frost_sign_share(
        &self,
        material: &FrostKeyMaterial,
        round1: &FrostRound1,
        client_commitments: &str,
        message: &[u8],
    ) -> Result<String, CryptoError> {
        frost::sign_share(material, round1, client_commitments, message)
    }

    fn frost_aggregate(
        &self,
        material: &FrostKeyMaterial,
        round1: &FrostRound1,
        client_commitments: &str,
        message: &[u8],
        server_share: &str,
        client_share: &str,
    ) -> Result<String, CryptoError> {
        frost::aggregate(material, round1, client_commitments, message, server_share, client_share)
    }

    fn share_x(&self, curve: CurveType, node_name: &str) -> Result<[u8; 32], CryptoError> {
        match curve {
            CurveType::Secp256k1 => {
                let mut x: [u8; 32] = Sha256::digest(node_name.as_bytes()).into();
                // keeps the big-endian value below the group order
                x[0] &= 0x7f;
                Ok(x)
            }
            CurveType::Ed25519 => frost::derive_identifier(node_name),
        }
    }

    fn sss_split(
        &self,
        curve: CurveType,
        secret: &[u8; 32],
        xs: &[[u8; 32]],
        threshold: usize,
    ) -> Result<Vec<[u8; 32]>, CryptoError> {
        match curve {
            CurveType::Secp256k1 => split_in::<k256::Scalar>(secret, xs, threshold),
            CurveType::Ed25519 => split_in::<curve25519_dalek::Scalar>(secret, xs, threshold),
        }
    }

    fn sss_combine(
        &self,
        curve: CurveType,
        points: &[RawPoint],
        threshold: usize,
    ) -> Result<[u8; 32], CryptoError> {
        match curve {
            CurveType::Secp256k1 => combine_in::<k256::Scalar>(points, threshold),
            CurveType::Ed25519 => combine_in::<curve25519_dalek::Scalar>(points, threshold),
        }
    }

    fn sss_expand(
        &self,
        curve: CurveType,
        existing: &[RawPoint],
        new_xs: &[[u8; 32]],
        threshold: usize,
    ) -> Result<(Vec<[u8; 32]>, [u8; 32]), CryptoError> {
        match curve {
            CurveType::Secp256k1 => expand_in::<k256::Scalar>(existing, new_xs, threshold),
            CurveType::Ed25519 => expand_in::<curve25519_dalek::Scalar>(existing, new_xs, threshold),
        }
    }

    fn scalar_base_mult(&self, curve: CurveType, scalar: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        match curve {
            CurveType::Secp256k1 => {
                let scalar = secp::scalar_from_bytes(scalar)?;
                Ok(secp::point_to_bytes(&(ProjectivePoint::GENERATOR * scalar)))
            }
            CurveType::Ed25519 => {
                let scalar = frost::ed_scalar(scalar)?;
                Ok(frost::base_mult(&scalar).to_vec())
            }
        }
    }
}

/// Parse a hex public key of the curve's fixed width
pub fn decode_public_key(curve: CurveType, value: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = match curve {
        CurveType::Secp256k1 => decode_fixed::<33>(value).map(|b| b.to_vec()),
        CurveType::Ed25519 => decode_fixed::<32>(value).map(|b| b.to_vec()),
    }
    .map_err(CryptoError::InvalidPoint)?;

    match curve {
        CurveType::Secp256k1 => {
            secp::point_from_bytes(&bytes)?;
        }
        CurveType::Ed25519 => {
            let mut fixed = [0u8; 32];
            fixed.copy_from_slice(&bytes);
            frost::ed_point(&fixed)?;
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secp::{encode_point, encode_scalar, random_scalar};
    use rand::rngs::OsRng;

    #[test]
    fn test_triples_step_bounds() {
        let engine = SoftwareEngine::new();
        let (state, msg) = engine.triples_step(1, None, None).unwrap();
        assert!(matches!(msg, TriplesMessage::Commit { triple: 0, .. }));
        assert!(engine.triples_step(1, Some(&state), None).is_err());
        assert!(engine.triples_step(2, Some(&state), None).is_err());
        assert!(engine.triples_step(11, Some(&state), Some(&msg)).is_err());
    }

    #[test]
    fn test_secp_x_has_top_bit_cleared() {
        let engine = SoftwareEngine::new();
        let x = engine.share_x(CurveType::Secp256k1, "ksn-alpha").unwrap();
        assert_eq!(x[0] & 0x80, 0);
        assert_ne!(x, engine.share_x(CurveType::Secp256k1, "ksn-beta").unwrap());
    }

    #[test]
    fn test_keygen_check() {
        let engine = SoftwareEngine::new();
        let x_s = random_scalar(&mut OsRng);
        let x_c = random_scalar(&mut OsRng);
        let mut payload = Secp256k1KeygenPayload {
            public_key: encode_point(&(ProjectivePoint::GENERATOR * (x_s + x_c))),
            client_public_share: encode_point(&(ProjectivePoint::GENERATOR * x_c)),
            server_share: encode_scalar(&x_s),
        };
        engine.ecdsa_keygen_check(&payload).unwrap();

        payload.server_share = encode_scalar(&x_c);
        assert!(matches!(
            engine.ecdsa_keygen_check(&payload),
            Err(CryptoError::InvalidPoint(_))
        ));
    }

    #[test]
    fn test_decode_public_key_widths() {
        let point = encode_point(&(ProjectivePoint::GENERATOR * random_scalar(&mut OsRng)));
        assert_eq!(decode_public_key(CurveType::Secp256k1, &point).unwrap().len(), 33);
        assert!(decode_public_key(CurveType::Ed25519, &point).is_err());
    }
}
