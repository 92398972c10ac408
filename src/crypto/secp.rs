//! secp256k1 encoding helpers

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar};
use rand::{CryptoRng, RngCore};

use super::CryptoError;

pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or_else(|| CryptoError::InvalidScalar("scalar out of range".to_string()))
}

pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}

pub fn decode_scalar(value: &str) -> Result<Scalar, CryptoError> {
    let bytes: [u8; 32] = crate::types::decode_fixed(value).map_err(CryptoError::InvalidScalar)?;
    scalar_from_bytes(&bytes)
}

pub fn encode_scalar(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

/// Compressed SEC1 bytes; the identity point is rejected
pub fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| CryptoError::InvalidPoint("not a valid secp256k1 point".to_string()))
}

pub fn point_to_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub fn decode_point(value: &str) -> Result<ProjectivePoint, CryptoError> {
    let bytes: [u8; 33] = crate::types::decode_fixed(value).map_err(CryptoError::InvalidPoint)?;
    point_from_bytes(&bytes)
}

pub fn encode_point(point: &ProjectivePoint) -> String {
    hex::encode(point_to_bytes(point))
}
