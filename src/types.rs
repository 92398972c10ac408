//! Records, wire types and the response envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::crypto::{EcdsaPresignMessage, TriplesMessage, TriplesPublic};

pub const WALLET_STATUS_ACTIVE: &str = "ACTIVE";

// =============================================================================
// Enumerations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveType {
    Secp256k1,
    Ed25519,
}

impl CurveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurveType::Secp256k1 => "secp256k1",
            CurveType::Ed25519 => "ed25519",
        }
    }

    /// Encoded public key width: compressed SEC1 or compressed Edwards
    pub fn public_key_len(&self) -> usize {
        match self {
            CurveType::Secp256k1 => 33,
            CurveType::Ed25519 => 32,
        }
    }
}

impl fmt::Display for CurveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secp256k1" => Ok(CurveType::Secp256k1),
            "ed25519" => Ok(CurveType::Ed25519),
            other => Err(format!("unknown curve: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    Triples,
    Keygen,
    SignEcdsa,
    SignEddsa,
}

impl StageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Triples => "TRIPLES",
            StageType::Keygen => "KEYGEN",
            StageType::SignEcdsa => "SIGN_ECDSA",
            StageType::SignEddsa => "SIGN_EDDSA",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIPLES" => Ok(StageType::Triples),
            "KEYGEN" => Ok(StageType::Keygen),
            "SIGN_ECDSA" => Ok(StageType::SignEcdsa),
            "SIGN_EDDSA" => Ok(StageType::SignEddsa),
            other => Err(format!("unknown stage type: {}", other)),
        }
    }
}

/// Stage status; `Step(n)` is used by the triples protocol (1..=10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Step(u8),
    Round1,
    Round2,
    Completed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Step(n) => write!(f, "STEP_{}", n),
            StageStatus::Round1 => f.write_str("ROUND_1"),
            StageStatus::Round2 => f.write_str("ROUND_2"),
            StageStatus::Completed => f.write_str("COMPLETED"),
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ROUND_1" => Ok(StageStatus::Round1),
            "ROUND_2" => Ok(StageStatus::Round2),
            "COMPLETED" => Ok(StageStatus::Completed),
            other => other
                .strip_prefix("STEP_")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=10).contains(n))
                .map(StageStatus::Step)
                .ok_or_else(|| format!("unknown stage status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeWalletStatus {
    Active,
    NotRegistered,
    UnrecoverableDataLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SignIn,
    SignUp,
    Reshare,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::SignIn => "sign_in",
            OperationType::SignUp => "sign_up",
            OperationType::Reshare => "reshare",
        }
    }

    pub fn allows(&self, api: ApiName) -> bool {
        matches!(
            (self, api),
            (OperationType::SignIn, ApiName::GetKeyShares)
                | (OperationType::SignUp, ApiName::Register)
                | (OperationType::Reshare, ApiName::GetKeyShares)
                | (OperationType::Reshare, ApiName::Reshare)
        )
    }

    /// The call that finishes the operation and closes its session
    pub fn terminal_api(&self) -> ApiName {
        match self {
            OperationType::SignIn => ApiName::GetKeyShares,
            OperationType::SignUp => ApiName::Register,
            OperationType::Reshare => ApiName::Reshare,
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sign_in" => Ok(OperationType::SignIn),
            "sign_up" => Ok(OperationType::SignUp),
            "reshare" => Ok(OperationType::Reshare),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiName {
    GetKeyShares,
    Register,
    Reshare,
}

impl ApiName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiName::GetKeyShares => "get_key_shares",
            ApiName::Register => "register",
            ApiName::Reshare => "reshare",
        }
    }
}

impl fmt::Display for ApiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get_key_shares" => Ok(ApiName::GetKeyShares),
            "register" => Ok(ApiName::Register),
            "reshare" => Ok(ApiName::Reshare),
            other => Err(format!("unknown api: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrSessionState {
    Committed,
    /// Accepted when read back from storage; nothing writes it
    Revealed,
    Completed,
}

impl CrSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrSessionState::Committed => "COMMITTED",
            CrSessionState::Revealed => "REVEALED",
            CrSessionState::Completed => "COMPLETED",
        }
    }
}

impl FromStr for CrSessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMMITTED" => Ok(CrSessionState::Committed),
            "REVEALED" => Ok(CrSessionState::Revealed),
            "COMPLETED" => Ok(CrSessionState::Completed),
            other => Err(format!("unknown session state: {}", other)),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Wallet {
    pub wallet_id: Uuid,
    pub user_id: Uuid,
    pub curve_type: CurveType,
    /// Hex, 33 bytes (secp256k1) or 32 bytes (ed25519)
    pub public_key: String,
    pub enc_tss_share: String,
    pub sss_threshold: u16,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TssSession {
    pub session_id: Uuid,
    pub wallet_id: Uuid,
    pub customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TssStage {
    pub stage_id: Uuid,
    pub session_id: Uuid,
    pub stage_type: StageType,
    pub stage_status: StageStatus,
    /// Sealed `StageData` JSON
    pub stage_data: String,
}

#[derive(Debug, Clone)]
pub struct CommitRevealSession {
    pub session_id: String,
    pub operation_type: OperationType,
    /// Hex ed25519 public key
    pub client_ephemeral_pubkey: String,
    /// Hex sha256(auth_type ‖ id_token)
    pub id_token_hash: String,
    pub state: CrSessionState,
    /// Hex ed25519 public key of the node that opened the session
    pub node_pubkey: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommitRevealApiCall {
    pub session_id: String,
    pub api_name: ApiName,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Node-local share record (the node never sees plaintext outside a request)
#[derive(Debug, Clone)]
pub struct KeyShareRecord {
    pub share_id: Uuid,
    pub wallet_id: Uuid,
    pub curve_type: CurveType,
    pub public_key: String,
    pub enc_share: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub reshared_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Shares and node sets
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareNodeMeta {
    pub node_id: String,
    pub name: String,
    pub endpoint: String,
    pub wallet_status: NodeWalletStatus,
}

/// Nodes participating in one wallet's sharing, plus its threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSet {
    pub nodes: Vec<KeyShareNodeMeta>,
    pub threshold: u16,
}

impl NodeSet {
    pub fn active(&self) -> impl Iterator<Item = &KeyShareNodeMeta> {
        self.nodes
            .iter()
            .filter(|n| n.wallet_status == NodeWalletStatus::Active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }
}

/// One Shamir point over secp256k1; both halves big-endian scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharePoint {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl SharePoint {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.x);
        bytes[32..].copy_from_slice(&self.y);
        bytes
    }

    /// Wire form: 64 bytes hex, `x ‖ y`
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(value: &str) -> Result<Self, String> {
        let bytes: [u8; 64] = decode_fixed(value)?;
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[..32]);
        y.copy_from_slice(&bytes[32..]);
        Ok(Self { x, y })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKeySharePoint {
    pub node: KeyShareNodeMeta,
    pub share: SharePoint,
}

/// FROST share held by one node; both fields little-endian ed25519 scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeddsaKeyShare {
    #[serde(with = "hex32")]
    pub identifier: [u8; 32],
    #[serde(with = "hex32")]
    pub signing_share: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTeddsaKeyShare {
    pub node: KeyShareNodeMeta,
    pub share: TeddsaKeyShare,
}

/// Decode a fixed-width hex string
pub fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], String> {
    let bytes = hex::decode(value.trim_start_matches("0x")).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected {} bytes, got {}", N, v.len()))
}

pub(crate) mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_fixed(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// `{success: true, data}` or `{success: false, code, msg}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            code: None,
            msg: None,
        }
    }

    pub fn err(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            code: Some(code.into()),
            msg: Some(msg.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub role: String,
    pub version: String,
}

// =============================================================================
// TSS API
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secp256k1KeygenPayload {
    /// Joint public key, hex 33 bytes
    pub public_key: String,
    /// Client's public share `x_c·G`, hex 33 bytes
    pub client_public_share: String,
    /// Server's secret share `x_s`, hex 32 bytes
    pub server_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ed25519KeygenPayload {
    /// Group verifying key, hex 32 bytes
    pub verifying_key: String,
    pub server_identifier: String,
    pub server_signing_share: String,
    pub client_identifier: String,
    pub client_verifying_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub email: String,
    #[serde(default)]
    pub wallet_id: Option<Uuid>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(flatten)]
    pub secp256k1: Secp256k1KeygenPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenV2Request {
    pub email: String,
    #[serde(default)]
    pub wallet_id: Option<Uuid>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub secp256k1: Secp256k1KeygenPayload,
    pub ed25519: Ed25519KeygenPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSummary {
    pub wallet_id: Uuid,
    pub curve_type: CurveType,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub session_id: Uuid,
    pub wallets: Vec<WalletSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriplesRequest {
    pub email: String,
    pub wallet_id: Uuid,
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Absent on step 1 only
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Client message for steps 2..=11
    #[serde(default)]
    pub message: Option<TriplesMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriplesResponse {
    pub session_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<TriplesMessage>,
    /// Agreed public view, returned by step 11
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<TriplesPublic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaRound1Request {
    pub email: String,
    pub wallet_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaRound1Response {
    pub session_id: Uuid,
    pub presign: EcdsaPresignMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaRound2Request {
    pub email: String,
    pub wallet_id: Uuid,
    pub session_id: Uuid,
    pub presign: EcdsaPresignMessage,
    /// Hex 32-byte message digest
    pub msg_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaRound2Response {
    pub session_id: Uuid,
    /// Hex 33-byte nonce point
    pub big_r: String,
    pub s_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaAggregateRequest {
    pub email: String,
    pub wallet_id: Uuid,
    pub session_id: Uuid,
    pub s_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcdsaAggregateResponse {
    pub session_id: Uuid,
    pub r: String,
    pub s: String,
    /// Recovery id
    pub v: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EddsaRound1Request {
    pub email: String,
    pub wallet_id: Uuid,
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Hex message to sign
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EddsaRound1Response {
    pub session_id: Uuid,
    pub identifier: String,
    pub commitments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EddsaRound2Request {
    pub email: String,
    pub wallet_id: Uuid,
    pub session_id: Uuid,
    pub client_commitments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EddsaRound2Response {
    pub session_id: Uuid,
    pub signature_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EddsaAggregateRequest {
    pub email: String,
    pub wallet_id: Uuid,
    pub session_id: Uuid,
    pub client_signature_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EddsaAggregateResponse {
    pub session_id: Uuid,
    /// Hex 64-byte ed25519 signature
    pub signature: String,
}

// =============================================================================
// Key-share node API
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub operation_type: OperationType,
    pub client_ephemeral_pubkey: String,
    pub id_token_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub cr_session_id: String,
    pub node_pubkey: String,
    pub expires_at: DateTime<Utc>,
}

/// Reveal fields carried by every gated request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevealFields {
    #[serde(default)]
    pub cr_session_id: Option<String>,
    #[serde(default)]
    pub cr_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyShareRequest {
    pub cr_session_id: String,
    pub cr_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecpShareEntry {
    pub public_key: String,
    /// 64 bytes hex, `x ‖ y`
    pub share: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519ShareEntry {
    pub public_key: String,
    pub identifier: String,
    pub signing_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyShareV1Response {
    pub public_key: String,
    pub share: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyShareV2Response {
    #[serde(default)]
    pub secp256k1: Option<SecpShareEntry>,
    #[serde(default)]
    pub ed25519: Option<Ed25519ShareEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub secp256k1: NodeWalletStatus,
    pub ed25519: NodeWalletStatus,
}

impl CheckResponse {
    pub fn status_for(&self, curve: CurveType) -> NodeWalletStatus {
        match curve {
            CurveType::Secp256k1 => self.secp256k1,
            CurveType::Ed25519 => self.ed25519,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub cr_session_id: String,
    pub cr_signature: String,
    pub public_key: String,
    pub share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterEd25519Request {
    pub cr_session_id: String,
    pub cr_signature: String,
    pub public_key: String,
    pub identifier: String,
    pub signing_share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub share_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshareRequest {
    pub cr_session_id: String,
    pub cr_signature: String,
    #[serde(default)]
    pub secp256k1: Option<SecpShareEntry>,
    #[serde(default)]
    pub ed25519: Option<Ed25519ShareEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshareResponse {
    pub reshared_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_strings() {
        assert_eq!(StageStatus::Step(7).to_string(), "STEP_7");
        assert_eq!("STEP_10".parse::<StageStatus>().unwrap(), StageStatus::Step(10));
        assert_eq!("ROUND_2".parse::<StageStatus>().unwrap(), StageStatus::Round2);
        assert!("STEP_11".parse::<StageStatus>().is_err());
        assert!(StageStatus::Completed.is_terminal());
    }

    #[test]
    fn test_operation_allow_list() {
        assert!(OperationType::SignIn.allows(ApiName::GetKeyShares));
        assert!(!OperationType::SignIn.allows(ApiName::Reshare));
        assert!(!OperationType::SignUp.allows(ApiName::GetKeyShares));
        assert!(OperationType::Reshare.allows(ApiName::GetKeyShares));
        assert!(OperationType::Reshare.allows(ApiName::Reshare));
        assert_eq!(OperationType::Reshare.terminal_api(), ApiName::Reshare);
    }

    #[test]
    fn test_share_point_wire_form() {
        let point = SharePoint { x: [1u8; 32], y: [2u8; 32] };
        let wire = point.to_hex();
        assert_eq!(wire.len(), 128);
        assert_eq!(SharePoint::from_hex(&wire).unwrap(), point);
        assert!(SharePoint::from_hex(&wire[..126]).is_err());
    }

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(ApiResponse::ok(1u8)).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": 1}));

        let err = serde_json::to_value(ApiResponse::<()>::err("SESSION_EXPIRED", "expired")).unwrap();
        assert_eq!(
            err,
            serde_json::json!({"success": false, "code": "SESSION_EXPIRED", "msg": "expired"})
        );
    }
}
