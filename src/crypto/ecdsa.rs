//! Two-party ECDSA signing from a pair of Beaver triples
//!
//! Triple 0 supplies the nonce: `k = a0`, `d = b0`, `kd = c0`. Opening `kd`
//! gives `R = kd⁻¹·D = k⁻¹·G`. Triple 1 turns the product `k·x` into
//! additive shares through the masked openings `ε = k − a1`, `δ = x − b1`.
//! Each party then holds `s_i = m·k_i + r·σ_i` and `Σ s_i = k(m + r·x)`,
//! the ECDSA `s` for nonce `k⁻¹`.

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::{ProjectivePoint, Scalar, U256};
use serde::{Deserialize, Serialize};

use super::secp::{decode_point, decode_scalar, encode_point, encode_scalar, point_from_bytes};
use super::triples::TriplesOutput;
use super::CryptoError;

/// Party that adds the public `ε·δ` term
pub const LEADER_PARTY: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaPresignMessage {
    pub kd: String,
    pub epsilon: String,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaPresignState {
    party: u32,
    k: String,
    a1: String,
    b1: String,
    c1: String,
    big_d: String,
    own: EcdsaPresignMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaShare {
    pub big_r: String,
    pub s: String,
    pub msg_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaSignature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

/// Build the presign message from this party's triples and key share
pub fn presign(
    triples: &TriplesOutput,
    key_share: &Scalar,
) -> Result<(EcdsaPresignState, EcdsaPresignMessage), CryptoError> {
    let [t0, t1] = triples.triples.as_slice() else {
        return Err(CryptoError::InvalidMessage("two triples are required".to_string()));
    };

    let k = decode_scalar(&t0.a)?;
    let a1 = decode_scalar(&t1.a)?;
    let b1 = decode_scalar(&t1.b)?;

    let own = EcdsaPresignMessage {
        kd: t0.c.clone(),
        epsilon: encode_scalar(&(k - a1)),
        delta: encode_scalar(&(*key_share - b1)),
    };
    let state = EcdsaPresignState {
        party: triples.party,
        k: t0.a.clone(),
        a1: t1.a.clone(),
        b1: t1.b.clone(),
        c1: t1.c.clone(),
        big_d: t0.public.big_b.clone(),
        own: own.clone(),
    };
    Ok((state, own))
}

/// Combine both presign messages and produce this party's share of `s`
pub fn sign_share(
    state: &EcdsaPresignState,
    peer: &EcdsaPresignMessage,
    msg_hash: &[u8; 32],
) -> Result<EcdsaShare, CryptoError> {
    let kd = decode_scalar(&state.own.kd)? + decode_scalar(&peer.kd)?;
    let epsilon = decode_scalar(&state.own.epsilon)? + decode_scalar(&peer.epsilon)?;
    let delta = decode_scalar(&state.own.delta)? + decode_scalar(&peer.delta)?;

    let kd_inv = Option::<Scalar>::from(kd.invert())
        .ok_or_else(|| CryptoError::InvalidMessage("kd opened to zero".to_string()))?;
    let big_r = decode_point(&state.big_d)? * kd_inv;
    let r = x_scalar(&big_r);

    let a1 = decode_scalar(&state.a1)?;
    let b1 = decode_scalar(&state.b1)?;
    let mut sigma = decode_scalar(&state.c1)? + epsilon * b1 + delta * a1;
    if state.party == LEADER_PARTY {
        sigma += epsilon * delta;
    }

    let m = <Scalar as Reduce<U256>>::reduce_bytes(&(*msg_hash).into());
    let s = m * decode_scalar(&state.k)? + r * sigma;

    Ok(EcdsaShare {
        big_r: encode_point(&big_r),
        s: encode_scalar(&s),
        msg_hash: hex::encode(msg_hash),
    })
}

fn x_scalar(point: &ProjectivePoint) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&point.to_affine().x())
}

/// Add the peer's share, normalise to low-s and verify under the wallet key
pub fn aggregate(
    own: &EcdsaShare,
    peer_s: &Scalar,
    public_key: &[u8],
) -> Result<EcdsaSignature, CryptoError> {
    let big_r = decode_point(&own.big_r)?;
    let r = x_scalar(&big_r);
    let s = decode_scalar(&own.s)? + peer_s;

    let signature = Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|_| CryptoError::Verification)?;
    let mut v = u8::from(bool::from(big_r.to_affine().y_is_odd()));
    let signature = match signature.normalize_s() {
        Some(normalized) => {
            v ^= 1;
            normalized
        }
        None => signature,
    };

    let result = EcdsaSignature {
        r: hex::encode(signature.r().to_bytes()),
        s: hex::encode(signature.s().to_bytes()),
        v,
    };
    let msg_hash: [u8; 32] = crate::types::decode_fixed(&own.msg_hash).map_err(CryptoError::InvalidMessage)?;
    verify(public_key, &msg_hash, &result)?;
    Ok(result)
}

pub fn verify(public_key: &[u8], msg_hash: &[u8; 32], signature: &EcdsaSignature) -> Result<(), CryptoError> {
    point_from_bytes(public_key)?;
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| CryptoError::InvalidPoint("invalid verifying key".to_string()))?;
    let r = decode_scalar(&signature.r)?;
    let s = decode_scalar(&signature.s)?;
    let signature = Signature::from_scalars(r.to_bytes(), s.to_bytes()).map_err(|_| CryptoError::Verification)?;
    key.verify_prehash(msg_hash, &signature)
        .map_err(|_| CryptoError::Verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::triples::{TriplesParty, MESSAGE_COUNT};
    use crate::crypto::secp::random_scalar;
    use rand::rngs::OsRng;
    use sha2::{Digest, Sha256};

    fn triples_pair() -> (TriplesOutput, TriplesOutput) {
        let mut server = TriplesParty::new(0, 1);
        let mut client = TriplesParty::new(1, 0);
        for index in 0..MESSAGE_COUNT {
            client.receive(index, &server.emit(index).unwrap()).unwrap();
            server.receive(index, &client.emit(index).unwrap()).unwrap();
        }
        (server.output().unwrap(), client.output().unwrap())
    }

    #[test]
    fn test_two_party_signature_verifies() {
        let x_s = random_scalar(&mut OsRng);
        let x_c = random_scalar(&mut OsRng);
        let public_key = crate::crypto::secp::point_to_bytes(&(ProjectivePoint::GENERATOR * (x_s + x_c)));

        let (ts, tc) = triples_pair();
        let (state_s, msg_s) = presign(&ts, &x_s).unwrap();
        let (state_c, msg_c) = presign(&tc, &x_c).unwrap();

        let digest: [u8; 32] = Sha256::digest(b"transfer 1 BTC").into();
        let share_s = sign_share(&state_s, &msg_c, &digest).unwrap();
        let share_c = sign_share(&state_c, &msg_s, &digest).unwrap();
        assert_eq!(share_s.big_r, share_c.big_r);

        let peer_s = decode_scalar(&share_c.s).unwrap();
        let signature = aggregate(&share_s, &peer_s, &public_key).unwrap();
        verify(&public_key, &digest, &signature).unwrap();
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let x_s = random_scalar(&mut OsRng);
        let x_c = random_scalar(&mut OsRng);
        let other = crate::crypto::secp::point_to_bytes(&(ProjectivePoint::GENERATOR * x_s));

        let (ts, tc) = triples_pair();
        let (state_s, msg_s) = presign(&ts, &x_s).unwrap();
        let (state_c, msg_c) = presign(&tc, &x_c).unwrap();
        let digest = [7u8; 32];
        let share_s = sign_share(&state_s, &msg_c, &digest).unwrap();
        let share_c = sign_share(&state_c, &msg_s, &digest).unwrap();

        let peer_s = decode_scalar(&share_c.s).unwrap();
        assert!(matches!(
            aggregate(&share_s, &peer_s, &other),
            Err(CryptoError::Verification)
        ));
    }
}
