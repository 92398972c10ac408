//! Curve arithmetic behind one trait
//!
//! Everything that touches secp256k1 or ed25519 goes through `CryptoEngine`.
//! Stage handlers, the Shamir engine and the key-share node only move bytes
//! and hex strings around.

pub mod ecdsa;
pub mod frost;
pub mod secp;
pub mod shamir;
pub mod software;
pub mod triples;

use thiserror::Error;

use crate::types::{CurveType, Ed25519KeygenPayload, Secp256k1KeygenPayload};

pub use ecdsa::{EcdsaPresignMessage, EcdsaPresignState, EcdsaShare, EcdsaSignature};
pub use frost::{FrostKeyMaterial, FrostRound1};
pub use software::SoftwareEngine;
pub use triples::{TriplePublic, TriplesMessage, TriplesOutput, TriplesParty, TriplesPublic};

/// Party index of the TSS server in two-party protocols
pub const SERVER_PARTY: u32 = 0;
/// Party index of the wallet client
pub const CLIENT_PARTY: u32 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid point: {0}")]
    InvalidPoint(String),
    #[error("invalid scalar: {0}")]
    InvalidScalar(String),
    #[error("threshold error: {0}")]
    Threshold(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("commitment mismatch: {0}")]
    CommitmentMismatch(String),
    #[error("inconsistent shares: {0}")]
    InconsistentShares(String),
    #[error("signature verification failed")]
    Verification,
    #[error("FROST error: {0}")]
    Frost(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A Shamir point as raw scalars: `(x, y)`
pub type RawPoint = ([u8; 32], [u8; 32]);

pub trait CryptoEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Triples round `step` (1..=10) for the server party.
    /// Step 1 takes no state and no message.
    fn triples_step(
        &self,
        step: u8,
        state: Option<&TriplesParty>,
        incoming: Option<&TriplesMessage>,
    ) -> Result<(TriplesParty, TriplesMessage), CryptoError>;

    /// `pub_v` recomputed from local state
    fn triples_public(&self, state: &TriplesParty) -> Result<TriplesPublic, CryptoError>;

    fn triples_output(&self, state: &TriplesParty) -> Result<TriplesOutput, CryptoError>;

    /// `server_share·G + client_public_share == public_key`
    fn ecdsa_keygen_check(&self, payload: &Secp256k1KeygenPayload) -> Result<(), CryptoError>;

    fn ecdsa_presign(
        &self,
        triples: &TriplesOutput,
        key_share: &[u8; 32],
    ) -> Result<(EcdsaPresignState, EcdsaPresignMessage), CryptoError>;

    fn ecdsa_sign_share(
        &self,
        state: &EcdsaPresignState,
        peer: &EcdsaPresignMessage,
        msg_hash: &[u8; 32],
    ) -> Result<EcdsaShare, CryptoError>;

    fn ecdsa_aggregate(
        &self,
        own: &EcdsaShare,
        peer_s: &[u8; 32],
        public_key: &[u8],
    ) -> Result<EcdsaSignature, CryptoError>;

    fn ecdsa_verify(
        &self,
        public_key: &[u8],
        msg_hash: &[u8; 32],
        signature: &EcdsaSignature,
    ) -> Result<(), CryptoError>;

    /// Validate a centralized ed25519 keygen and extract the server's key
    fn frost_key_package(&self, payload: &Ed25519KeygenPayload) -> Result<FrostKeyMaterial, CryptoError>;

    fn frost_commit(&self, material: &FrostKeyMaterial) -> Result<FrostRound1, CryptoError>;

    fn frost_sign_share(
        &self,
        material: &FrostKeyMaterial,
        round1: &FrostRound1,
        client_commitments: &str,
        message: &[u8],
    ) -> Result<String, CryptoError>;

    fn frost_aggregate(
        &self,
        material: &FrostKeyMaterial,
        round1: &FrostRound1,
        client_commitments: &str,
        message: &[u8],
        server_share: &str,
        client_share: &str,
    ) -> Result<String, CryptoError>;

    /// x-coordinate of a node: hashed name (secp256k1) or FROST identifier (ed25519)
    fn share_x(&self, curve: CurveType, node_name: &str) -> Result<[u8; 32], CryptoError>;

    fn sss_split(
        &self,
        curve: CurveType,
        secret: &[u8; 32],
        xs: &[[u8; 32]],
        threshold: usize,
    ) -> Result<Vec<[u8; 32]>, CryptoError>;

    fn sss_combine(
        &self,
        curve: CurveType,
        points: &[RawPoint],
        threshold: usize,
    ) -> Result<[u8; 32], CryptoError>;

    /// y values at `new_xs` on the polynomial through `existing`, plus the secret
    fn sss_expand(
        &self,
        curve: CurveType,
        existing: &[RawPoint],
        new_xs: &[[u8; 32]],
        threshold: usize,
    ) -> Result<(Vec<[u8; 32]>, [u8; 32]), CryptoError>;

    /// Compressed `scalar·G`
    fn scalar_base_mult(&self, curve: CurveType, scalar: &[u8; 32]) -> Result<Vec<u8>, CryptoError>;
}
