//! Storage trait definitions
//!
//! `TssStore` backs the TSS API (users, wallets, sessions, stages).
//! `KsnStore` backs a key-share node (identities, shares, commit-reveal).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    ApiName, CommitRevealApiCall, CommitRevealSession, CurveType, KeyShareRecord, StageStatus,
    StageType, TssSession, TssStage, User, Wallet,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Compare-and-swap lost: the row was not in the expected state
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("API already called: {0}")]
    AlreadyCalled(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Wallet row before its owner is resolved
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub wallet_id: Uuid,
    pub curve_type: CurveType,
    pub public_key: String,
    pub enc_tss_share: String,
    pub sss_threshold: u16,
}

/// Everything a keygen writes, committed in one transaction
#[derive(Debug, Clone)]
pub struct KeygenRecord {
    pub email: String,
    pub wallets: Vec<NewWallet>,
    pub session: TssSession,
    pub stage: TssStage,
}

/// TSS server storage
///
/// Implementations:
/// - `SqliteTssStore` - SQLite with an r2d2 pool
#[async_trait]
pub trait TssStore: Send + Sync {
    async fn get_user_by_email(&self, email: &str) -> StorageResult<Option<User>>;

    async fn get_wallet(&self, wallet_id: Uuid) -> StorageResult<Option<Wallet>>;

    async fn get_wallet_by_user_curve(
        &self,
        user_id: Uuid,
        curve: CurveType,
    ) -> StorageResult<Option<Wallet>>;

    async fn get_wallet_by_public_key(
        &self,
        curve: CurveType,
        public_key: &str,
    ) -> StorageResult<Option<Wallet>>;

    /// Insert user (if new), wallets, session and stage atomically
    async fn create_keygen(&self, record: &KeygenRecord) -> StorageResult<User>;

    /// Insert a session together with its first stage
    async fn create_session(&self, session: &TssSession, stage: &TssStage) -> StorageResult<()>;

    /// Add a stage to an existing session; `Duplicate` if the type exists
    async fn insert_stage(&self, stage: &TssStage) -> StorageResult<()>;

    async fn get_session(&self, session_id: Uuid) -> StorageResult<Option<TssSession>>;

    async fn get_stage(
        &self,
        session_id: Uuid,
        stage_type: StageType,
    ) -> StorageResult<Option<TssStage>>;

    /// Compare-and-swap on `stage_status`; `Conflict` when the row was not at `expected`
    async fn transition_stage(
        &self,
        session_id: Uuid,
        stage_type: StageType,
        expected: StageStatus,
        next: StageStatus,
        stage_data: &str,
    ) -> StorageResult<()>;
}

/// Key-share node storage
///
/// Implementations:
/// - `SqliteKsnStore` - SQLite with an r2d2 pool
#[async_trait]
pub trait KsnStore: Send + Sync {
    async fn get_or_create_user(&self, auth_type: &str, user_identifier: &str) -> StorageResult<Uuid>;

    async fn find_user(&self, auth_type: &str, user_identifier: &str) -> StorageResult<Option<Uuid>>;

    /// Insert wallet and share; `Duplicate` if the user already holds one for the curve
    async fn insert_key_share(&self, user_id: Uuid, record: &KeyShareRecord) -> StorageResult<()>;

    async fn get_key_share(
        &self,
        user_id: Uuid,
        curve: CurveType,
    ) -> StorageResult<Option<KeyShareRecord>>;

    async fn mark_reshared(&self, share_id: Uuid, at: DateTime<Utc>) -> StorageResult<()>;

    async fn create_cr_session(&self, session: &CommitRevealSession) -> StorageResult<()>;

    async fn get_cr_session(&self, session_id: &str) -> StorageResult<Option<CommitRevealSession>>;

    async fn is_api_called(&self, session_id: &str, api: ApiName) -> StorageResult<bool>;

    /// One transaction: session still `COMMITTED`, ledger insert, optional completion.
    /// `AlreadyCalled` when the pair is taken, `Conflict` when the session moved on.
    async fn consume_api_call(
        &self,
        call: &CommitRevealApiCall,
        complete_session: bool,
    ) -> StorageResult<()>;
}
