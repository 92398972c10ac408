//! FROST 2-of-2 over ed25519 (server ↔ client)
//!
//! The server's key material is produced by the client's centralized keygen
//! and checked here before it is stored. Identifiers and signing shares are
//! little-endian ed25519 scalars, exactly as `frost-ed25519` serializes them.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::{EdwardsPoint, Scalar};
use frost_ed25519 as frost;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::shamir;
use super::CryptoError;
use crate::types::{decode_fixed, Ed25519KeygenPayload};

/// Server-side FROST key, sealed into `enc_tss_share`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostKeyMaterial {
    pub identifier: String,
    pub signing_share: String,
    pub verifying_key: String,
    pub client_identifier: String,
    pub client_verifying_share: String,
}

/// Round-one output kept by the server between rounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostRound1 {
    pub nonces: String,
    pub commitments: String,
}

fn frost_err(e: frost::Error) -> CryptoError {
    CryptoError::Frost(e.to_string())
}

fn bytes32(value: &str, what: &str) -> Result<[u8; 32], CryptoError> {
    decode_fixed(value).map_err(|e| CryptoError::InvalidScalar(format!("{}: {}", what, e)))
}

pub fn ed_scalar(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    shamir::from_bytes::<Scalar>(bytes)
}

pub fn ed_point(bytes: &[u8; 32]) -> Result<EdwardsPoint, CryptoError> {
    CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidPoint("not a valid ed25519 point".to_string()))
}

pub fn base_mult(scalar: &Scalar) -> [u8; 32] {
    EdwardsPoint::mul_base(scalar).compress().to_bytes()
}

/// `Identifier::derive(name)` as a 32-byte scalar
pub fn derive_identifier(name: &str) -> Result<[u8; 32], CryptoError> {
    let identifier = frost::Identifier::derive(name.as_bytes()).map_err(frost_err)?;
    identifier
        .serialize()
        .try_into()
        .map_err(|_| CryptoError::Serialization("identifier is not 32 bytes".to_string()))
}

/// Check the client's keygen output: `λ_s·(s_s·G) + λ_c·Y_c == Y`
pub fn key_material(payload: &Ed25519KeygenPayload) -> Result<FrostKeyMaterial, CryptoError> {
    let server_id = ed_scalar(&bytes32(&payload.server_identifier, "server_identifier")?)?;
    let client_id = ed_scalar(&bytes32(&payload.client_identifier, "client_identifier")?)?;
    let signing_share = ed_scalar(&bytes32(&payload.server_signing_share, "server_signing_share")?)?;
    let client_share_point = ed_point(&bytes32(&payload.client_verifying_share, "client_verifying_share")?)?;
    let verifying_key = ed_point(&bytes32(&payload.verifying_key, "verifying_key")?)?;

    let xs = [server_id, client_id];
    let zero = Scalar::ZERO;
    let lambda_s = shamir::lagrange_coefficient(&server_id, &xs, &zero)?;
    let lambda_c = shamir::lagrange_coefficient(&client_id, &xs, &zero)?;

    let recombined = EdwardsPoint::mul_base(&signing_share) * lambda_s + client_share_point * lambda_c;
    if recombined != verifying_key {
        return Err(CryptoError::InvalidPoint(
            "shares do not recombine to the verifying key".to_string(),
        ));
    }

    Ok(FrostKeyMaterial {
        identifier: payload.server_identifier.clone(),
        signing_share: payload.server_signing_share.clone(),
        verifying_key: payload.verifying_key.clone(),
        client_identifier: payload.client_identifier.clone(),
        client_verifying_share: payload.client_verifying_share.clone(),
    })
}

struct Packages {
    identifier: frost::Identifier,
    client_identifier: frost::Identifier,
    key_package: frost::keys::KeyPackage,
    public_key_package: frost::keys::PublicKeyPackage,
}

fn packages(material: &FrostKeyMaterial) -> Result<Packages, CryptoError> {
    let id_bytes = bytes32(&material.identifier, "identifier")?;
    let client_id_bytes = bytes32(&material.client_identifier, "client_identifier")?;
    let share_bytes = bytes32(&material.signing_share, "signing_share")?;
    let vk_bytes = bytes32(&material.verifying_key, "verifying_key")?;
    let client_vs_bytes = bytes32(&material.client_verifying_share, "client_verifying_share")?;

    let identifier = frost::Identifier::deserialize(&id_bytes).map_err(frost_err)?;
    let client_identifier = frost::Identifier::deserialize(&client_id_bytes).map_err(frost_err)?;
    let signing_share = frost::keys::SigningShare::deserialize(&share_bytes).map_err(frost_err)?;
    let verifying_share =
        frost::keys::VerifyingShare::deserialize(&base_mult(&ed_scalar(&share_bytes)?)).map_err(frost_err)?;
    let client_verifying_share = frost::keys::VerifyingShare::deserialize(&client_vs_bytes).map_err(frost_err)?;
    let verifying_key = frost::VerifyingKey::deserialize(&vk_bytes).map_err(frost_err)?;

    let key_package = frost::keys::KeyPackage::new(identifier, signing_share, verifying_share, verifying_key, 2);

    let mut verifying_shares = BTreeMap::new();
    verifying_shares.insert(identifier, verifying_share);
    verifying_shares.insert(client_identifier, client_verifying_share);
    let public_key_package = frost::keys::PublicKeyPackage::new(verifying_shares, verifying_key);

    Ok(Packages {
        identifier,
        client_identifier,
        key_package,
        public_key_package,
    })
}

fn signing_package(
    packages: &Packages,
    round1: &FrostRound1,
    client_commitments: &str,
    message: &[u8],
) -> Result<frost::SigningPackage, CryptoError> {
    let own = frost::round1::SigningCommitments::deserialize(&decode_hex(&round1.commitments)?).map_err(frost_err)?;
    let peer = frost::round1::SigningCommitments::deserialize(&decode_hex(client_commitments)?).map_err(frost_err)?;

    let mut commitments = BTreeMap::new();
    commitments.insert(packages.identifier, own);
    commitments.insert(packages.client_identifier, peer);
    Ok(frost::SigningPackage::new(commitments, message))
}

fn decode_hex(value: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(value).map_err(|e| CryptoError::InvalidMessage(format!("invalid hex: {}", e)))
}

pub fn commit(material: &FrostKeyMaterial) -> Result<FrostRound1, CryptoError> {
    let packages = packages(material)?;
    let mut rng = rand::thread_rng();
    let (nonces, commitments) = frost::round1::commit(packages.key_package.signing_share(), &mut rng);

    Ok(FrostRound1 {
        nonces: hex::encode(nonces.serialize().map_err(frost_err)?),
        commitments: hex::encode(commitments.serialize().map_err(frost_err)?),
    })
}

pub fn sign_share(
    material: &FrostKeyMaterial,
    round1: &FrostRound1,
    client_commitments: &str,
    message: &[u8],
) -> Result<String, CryptoError> {
    let packages = packages(material)?;
    let signing_package = signing_package(&packages, round1, client_commitments, message)?;
    let nonces = frost::round1::SigningNonces::deserialize(&decode_hex(&round1.nonces)?).map_err(frost_err)?;

    let share = frost::round2::sign(&signing_package, &nonces, &packages.key_package).map_err(frost_err)?;
    Ok(hex::encode(share.serialize()))
}

/// Aggregate both shares and verify against the group key
pub fn aggregate(
    material: &FrostKeyMaterial,
    round1: &FrostRound1,
    client_commitments: &str,
    message: &[u8],
    server_share: &str,
    client_share: &str,
) -> Result<String, CryptoError> {
    let packages = packages(material)?;
    let signing_package = signing_package(&packages, round1, client_commitments, message)?;

    let mut shares = BTreeMap::new();
    shares.insert(
        packages.identifier,
        frost::round2::SignatureShare::deserialize(&decode_hex(server_share)?).map_err(frost_err)?,
    );
    shares.insert(
        packages.client_identifier,
        frost::round2::SignatureShare::deserialize(&decode_hex(client_share)?).map_err(frost_err)?,
    );

    // A bad client share fails here with a cheater-detection error
    let signature = frost::aggregate(&signing_package, &shares, &packages.public_key_package)
        .map_err(|_| CryptoError::Verification)?;
    packages
        .public_key_package
        .verifying_key()
        .verify(message, &signature)
        .map_err(|_| CryptoError::Verification)?;

    Ok(hex::encode(signature.serialize().map_err(frost_err)?))
}
