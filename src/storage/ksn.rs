//! SQLite storage for a key-share node
//!
//! Holds node-local identities, one encrypted share per (user, curve), the
//! commit-reveal sessions this node opened and the API consumption ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use uuid::Uuid;

use super::traits::{KsnStore, StorageError, StorageResult};
use super::{db_err, file_pool, from_millis, is_unique_violation, memory_pool, millis, parse_column, parse_uuid};
use crate::types::{ApiName, CommitRevealApiCall, CommitRevealSession, CrSessionState, CurveType, KeyShareRecord};

pub struct SqliteKsnStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteKsnStore {
    /// Open (or create) the database file and run migrations
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        let store = Self {
            pool: file_pool(db_path)?,
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let store = Self { pool: memory_pool()? };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                auth_type TEXT NOT NULL,
                user_identifier TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (auth_type, user_identifier)
            );

            CREATE TABLE IF NOT EXISTS wallets (
                wallet_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                curve_type TEXT NOT NULL,
                public_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (user_id, curve_type),
                UNIQUE (curve_type, public_key)
            );

            CREATE TABLE IF NOT EXISTS key_shares (
                share_id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL UNIQUE REFERENCES wallets(wallet_id),
                enc_share TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                reshared_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS cr_sessions (
                session_id TEXT PRIMARY KEY,
                operation_type TEXT NOT NULL,
                client_ephemeral_pubkey TEXT NOT NULL,
                id_token_hash TEXT NOT NULL,
                state TEXT NOT NULL,
                node_pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cr_api_calls (
                session_id TEXT NOT NULL REFERENCES cr_sessions(session_id),
                api_name TEXT NOT NULL,
                signature TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, api_name)
            );

            CREATE INDEX IF NOT EXISTS idx_cr_sessions_expires ON cr_sessions(expires_at);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn row_to_key_share(row: &rusqlite::Row) -> rusqlite::Result<KeyShareRecord> {
        Ok(KeyShareRecord {
            share_id: parse_uuid(0, row.get("share_id")?)?,
            wallet_id: parse_uuid(1, row.get("wallet_id")?)?,
            curve_type: parse_column(2, row.get("curve_type")?)?,
            public_key: row.get("public_key")?,
            enc_share: row.get("enc_share")?,
            status: row.get("status")?,
            created_at: from_millis(row.get("created_at")?),
            reshared_at: row.get::<_, Option<i64>>("reshared_at")?.map(from_millis),
        })
    }

    fn row_to_cr_session(row: &rusqlite::Row) -> rusqlite::Result<CommitRevealSession> {
        Ok(CommitRevealSession {
            session_id: row.get("session_id")?,
            operation_type: parse_column(1, row.get("operation_type")?)?,
            client_ephemeral_pubkey: row.get("client_ephemeral_pubkey")?,
            id_token_hash: row.get("id_token_hash")?,
            state: parse_column(4, row.get("state")?)?,
            node_pubkey: row.get("node_pubkey")?,
            created_at: from_millis(row.get("created_at")?),
            expires_at: from_millis(row.get("expires_at")?),
        })
    }

    // Synchronous helper methods for the trait implementations

    fn find_user_sync(&self, auth_type: &str, user_identifier: &str) -> Result<Option<Uuid>, StorageError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT user_id FROM users WHERE auth_type = ?1 AND user_identifier = ?2",
                params![auth_type, user_identifier],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        raw.map(|id| Uuid::parse_str(&id).map_err(|e| StorageError::InvalidData(e.to_string())))
            .transpose()
    }

    fn get_or_create_user_sync(&self, auth_type: &str, user_identifier: &str) -> Result<Uuid, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO users (user_id, auth_type, user_identifier, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                Uuid::new_v4().to_string(),
                auth_type,
                user_identifier,
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(db_err)?;
        drop(conn);

        self.find_user_sync(auth_type, user_identifier)?
            .ok_or_else(|| StorageError::NotFound(format!("user {}:{}", auth_type, user_identifier)))
    }

    fn insert_key_share_sync(&self, user_id: Uuid, record: &KeyShareRecord) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let duplicate = |e: rusqlite::Error| {
            if is_unique_violation(&e) {
                return StorageError::Duplicate(format!("{} share for {}", record.curve_type, user_id));
            }
            db_err(e)
        };

        tx.execute(
            r#"
            INSERT INTO wallets (wallet_id, user_id, curve_type, public_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.wallet_id.to_string(),
                user_id.to_string(),
                record.curve_type.as_str(),
                record.public_key,
                millis(&record.created_at),
            ],
        )
        .map_err(duplicate)?;

        tx.execute(
            r#"
            INSERT INTO key_shares (share_id, wallet_id, enc_share, status, created_at, reshared_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.share_id.to_string(),
                record.wallet_id.to_string(),
                record.enc_share,
                record.status,
                millis(&record.created_at),
                record.reshared_at.as_ref().map(millis),
            ],
        )
        .map_err(duplicate)?;

        tx.commit().map_err(db_err)
    }

    fn get_key_share_sync(&self, user_id: Uuid, curve: CurveType) -> Result<Option<KeyShareRecord>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT k.share_id, k.wallet_id, w.curve_type, w.public_key, k.enc_share, k.status,
                   k.created_at, k.reshared_at
            FROM key_shares k JOIN wallets w ON w.wallet_id = k.wallet_id
            WHERE w.user_id = ?1 AND w.curve_type = ?2
            "#,
            params![user_id.to_string(), curve.as_str()],
            |row| Self::row_to_key_share(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn mark_reshared_sync(&self, share_id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE key_shares SET reshared_at = ?1 WHERE share_id = ?2",
                params![millis(&at), share_id.to_string()],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(format!("share {}", share_id)));
        }
        Ok(())
    }

    fn create_cr_session_sync(&self, session: &CommitRevealSession) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cr_sessions (
                session_id, operation_type, client_ephemeral_pubkey, id_token_hash,
                state, node_pubkey, created_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session.session_id,
                session.operation_type.as_str(),
                session.client_ephemeral_pubkey,
                session.id_token_hash,
                session.state.as_str(),
                session.node_pubkey,
                millis(&session.created_at),
                millis(&session.expires_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StorageError::Duplicate(format!("cr session {}", session.session_id));
            }
            db_err(e)
        })?;
        Ok(())
    }

    fn get_cr_session_sync(&self, session_id: &str) -> Result<Option<CommitRevealSession>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT session_id, operation_type, client_ephemeral_pubkey, id_token_hash,
                   state, node_pubkey, created_at, expires_at
            FROM cr_sessions WHERE session_id = ?1
            "#,
            params![session_id],
            |row| Self::row_to_cr_session(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn is_api_called_sync(&self, session_id: &str, api: ApiName) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM cr_api_calls WHERE session_id = ?1 AND api_name = ?2",
                params![session_id, api.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    fn consume_api_call_sync(&self, call: &CommitRevealApiCall, complete_session: bool) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        // take the write lock before the state read; a deferred upgrade loses with SQLITE_BUSY
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM cr_sessions WHERE session_id = ?1",
                params![call.session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let state = state.ok_or_else(|| StorageError::NotFound(format!("cr session {}", call.session_id)))?;
        if state != CrSessionState::Committed.as_str() {
            return Err(StorageError::Conflict(format!(
                "cr session {} is {}",
                call.session_id, state
            )));
        }

        tx.execute(
            r#"
            INSERT INTO cr_api_calls (session_id, api_name, signature, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                call.session_id,
                call.api_name.as_str(),
                call.signature,
                millis(&call.created_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StorageError::AlreadyCalled(call.api_name.to_string());
            }
            db_err(e)
        })?;

        if complete_session {
            tx.execute(
                "UPDATE cr_sessions SET state = ?1 WHERE session_id = ?2 AND state = ?3",
                params![
                    CrSessionState::Completed.as_str(),
                    call.session_id,
                    CrSessionState::Committed.as_str(),
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)
    }
}

#[async_trait]
impl KsnStore for SqliteKsnStore {
    async fn get_or_create_user(&self, auth_type: &str, user_identifier: &str) -> StorageResult<Uuid> {
        self.get_or_create_user_sync(auth_type, user_identifier)
    }

    async fn find_user(&self, auth_type: &str, user_identifier: &str) -> StorageResult<Option<Uuid>> {
        self.find_user_sync(auth_type, user_identifier)
    }

    async fn insert_key_share(&self, user_id: Uuid, record: &KeyShareRecord) -> StorageResult<()> {
        self.insert_key_share_sync(user_id, record)
    }

    async fn get_key_share(&self, user_id: Uuid, curve: CurveType) -> StorageResult<Option<KeyShareRecord>> {
        self.get_key_share_sync(user_id, curve)
    }

    async fn mark_reshared(&self, share_id: Uuid, at: DateTime<Utc>) -> StorageResult<()> {
        self.mark_reshared_sync(share_id, at)
    }

    async fn create_cr_session(&self, session: &CommitRevealSession) -> StorageResult<()> {
        self.create_cr_session_sync(session)
    }

    async fn get_cr_session(&self, session_id: &str) -> StorageResult<Option<CommitRevealSession>> {
        self.get_cr_session_sync(session_id)
    }

    async fn is_api_called(&self, session_id: &str, api: ApiName) -> StorageResult<bool> {
        self.is_api_called_sync(session_id, api)
    }

    async fn consume_api_call(&self, call: &CommitRevealApiCall, complete_session: bool) -> StorageResult<()> {
        self.consume_api_call_sync(call, complete_session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationType;
    use chrono::Duration;

    fn cr_session(id: &str, operation_type: OperationType) -> CommitRevealSession {
        let now = Utc::now();
        CommitRevealSession {
            session_id: id.to_string(),
            operation_type,
            client_ephemeral_pubkey: "ab".repeat(32),
            id_token_hash: "cd".repeat(32),
            state: CrSessionState::Committed,
            node_pubkey: "ef".repeat(32),
            created_at: now,
            expires_at: now + Duration::minutes(5),
        }
    }

    fn api_call(session_id: &str, api_name: ApiName) -> CommitRevealApiCall {
        CommitRevealApiCall {
            session_id: session_id.to_string(),
            api_name,
            signature: "00".repeat(64),
            created_at: Utc::now(),
        }
    }

    fn share_record(curve: CurveType, public_key: &str) -> KeyShareRecord {
        KeyShareRecord {
            share_id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            curve_type: curve,
            public_key: public_key.to_string(),
            enc_share: "sealed".to_string(),
            status: "ACTIVE".to_string(),
            created_at: Utc::now(),
            reshared_at: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_user_is_stable() {
        let store = SqliteKsnStore::in_memory().unwrap();
        let first = store.get_or_create_user("google", "alice@example.com").await.unwrap();
        let second = store.get_or_create_user("google", "alice@example.com").await.unwrap();
        assert_eq!(first, second);

        let other = store.get_or_create_user("apple", "alice@example.com").await.unwrap();
        assert_ne!(first, other);
        assert!(store.find_user("google", "bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_share_per_user_curve() {
        let store = SqliteKsnStore::in_memory().unwrap();
        let user = store.get_or_create_user("google", "alice@example.com").await.unwrap();

        store.insert_key_share(user, &share_record(CurveType::Secp256k1, "02aa")).await.unwrap();
        store.insert_key_share(user, &share_record(CurveType::Ed25519, "aa")).await.unwrap();

        let again = store.insert_key_share(user, &share_record(CurveType::Secp256k1, "02bb")).await;
        assert!(matches!(again, Err(StorageError::Duplicate(_))));

        let share = store.get_key_share(user, CurveType::Secp256k1).await.unwrap().unwrap();
        assert_eq!(share.public_key, "02aa");
        assert!(share.reshared_at.is_none());

        let at = Utc::now();
        store.mark_reshared(share.share_id, at).await.unwrap();
        let share = store.get_key_share(user, CurveType::Secp256k1).await.unwrap().unwrap();
        assert_eq!(share.reshared_at.map(|t| t.timestamp_millis()), Some(at.timestamp_millis()));
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let store = SqliteKsnStore::in_memory().unwrap();
        store.create_cr_session(&cr_session("cr-1", OperationType::Reshare)).await.unwrap();

        store.consume_api_call(&api_call("cr-1", ApiName::GetKeyShares), false).await.unwrap();
        assert!(store.is_api_called("cr-1", ApiName::GetKeyShares).await.unwrap());
        assert!(!store.is_api_called("cr-1", ApiName::Reshare).await.unwrap());

        let replay = store.consume_api_call(&api_call("cr-1", ApiName::GetKeyShares), false).await;
        assert!(matches!(replay, Err(StorageError::AlreadyCalled(_))));

        // terminal call closes the session
        store.consume_api_call(&api_call("cr-1", ApiName::Reshare), true).await.unwrap();
        let session = store.get_cr_session("cr-1").await.unwrap().unwrap();
        assert_eq!(session.state, CrSessionState::Completed);
    }

    #[test]
    fn test_concurrent_consume_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKsnStore::new(dir.path().join("ksn.db")).unwrap();

        for (id, terminal) in [("cr-race-1", false), ("cr-race-2", true)] {
            store.create_cr_session_sync(&cr_session(id, OperationType::Reshare)).unwrap();
            let api = if terminal { ApiName::Reshare } else { ApiName::GetKeyShares };
            let barrier = std::sync::Barrier::new(4);

            let results: Vec<Result<(), StorageError>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let (store, barrier) = (&store, &barrier);
                        scope.spawn(move || {
                            barrier.wait();
                            store.consume_api_call_sync(&api_call(id, api), terminal)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{}", id);
            for err in results.into_iter().filter_map(Result::err) {
                assert!(
                    matches!(err, StorageError::AlreadyCalled(_) | StorageError::Conflict(_)),
                    "{}: {:?}",
                    id,
                    err
                );
            }
        }
    }

    #[tokio::test]
    async fn test_consume_after_completion_conflicts() {
        let store = SqliteKsnStore::in_memory().unwrap();
        store.create_cr_session(&cr_session("cr-2", OperationType::SignIn)).await.unwrap();
        store.consume_api_call(&api_call("cr-2", ApiName::GetKeyShares), true).await.unwrap();

        let late = store.consume_api_call(&api_call("cr-2", ApiName::Register), false).await;
        assert!(matches!(late, Err(StorageError::Conflict(_))));

        let missing = store.consume_api_call(&api_call("cr-404", ApiName::Register), false).await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }
}
