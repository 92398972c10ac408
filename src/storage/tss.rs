//! SQLite storage for the TSS server
//!
//! Stage transitions are a single `UPDATE ... WHERE stage_status = ?` so two
//! concurrent calls for the same round cannot both succeed.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use uuid::Uuid;

use super::traits::{KeygenRecord, StorageError, StorageResult, TssStore};
use super::{db_err, file_pool, from_millis, is_unique_violation, memory_pool, millis, parse_column, parse_uuid};
use crate::types::{CurveType, StageStatus, StageType, TssSession, TssStage, User, Wallet, WALLET_STATUS_ACTIVE};

pub struct SqliteTssStore {
    pool: Pool<SqliteConnectionManager>,
}

const WALLET_COLUMNS: &str =
    "wallet_id, user_id, curve_type, public_key, enc_tss_share, sss_threshold, status, created_at";

impl SqliteTssStore {
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
                email TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wallets (
                wallet_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                curve_type TEXT NOT NULL,
                public_key TEXT NOT NULL,
                enc_tss_share TEXT NOT NULL,
                sss_threshold INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (curve_type, public_key),
                UNIQUE (user_id, curve_type)
            );

            CREATE TABLE IF NOT EXISTS tss_sessions (
                session_id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL REFERENCES wallets(wallet_id),
                customer_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tss_stages (
                stage_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES tss_sessions(session_id),
                stage_type TEXT NOT NULL,
                stage_status TEXT NOT NULL,
                stage_data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (session_id, stage_type)
            );

            CREATE INDEX IF NOT EXISTS idx_wallets_user ON wallets(user_id);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            user_id: parse_uuid(0, row.get("user_id")?)?,
            email: row.get("email")?,
            created_at: from_millis(row.get("created_at")?),
        })
    }

    fn row_to_wallet(row: &rusqlite::Row) -> rusqlite::Result<Wallet> {
        Ok(Wallet {
            wallet_id: parse_uuid(0, row.get("wallet_id")?)?,
            user_id: parse_uuid(1, row.get("user_id")?)?,
            curve_type: parse_column(2, row.get("curve_type")?)?,
            public_key: row.get("public_key")?,
            enc_tss_share: row.get("enc_tss_share")?,
            sss_threshold: row.get::<_, i64>("sss_threshold")? as u16,
            status: row.get("status")?,
            created_at: from_millis(row.get("created_at")?),
        })
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<TssSession> {
        Ok(TssSession {
            session_id: parse_uuid(0, row.get("session_id")?)?,
            wallet_id: parse_uuid(1, row.get("wallet_id")?)?,
            customer_id: row.get("customer_id")?,
            created_at: from_millis(row.get("created_at")?),
        })
    }

    fn row_to_stage(row: &rusqlite::Row) -> rusqlite::Result<TssStage> {
        Ok(TssStage {
            stage_id: parse_uuid(0, row.get("stage_id")?)?,
            session_id: parse_uuid(1, row.get("session_id")?)?,
            stage_type: parse_column(2, row.get("stage_type")?)?,
            stage_status: parse_column(3, row.get("stage_status")?)?,
            stage_data: row.get("stage_data")?,
        })
    }

    fn insert_session_tx(tx: &Transaction, session: &TssSession) -> Result<(), StorageError> {
        tx.execute(
            "INSERT INTO tss_sessions (session_id, wallet_id, customer_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.session_id.to_string(),
                session.wallet_id.to_string(),
                session.customer_id,
                millis(&session.created_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StorageError::Duplicate(format!("session {}", session.session_id));
            }
            db_err(e)
        })?;
        Ok(())
    }

    fn insert_stage_tx(conn: &rusqlite::Connection, stage: &TssStage) -> Result<(), StorageError> {
        conn.execute(
            r#"
            INSERT INTO tss_stages (stage_id, session_id, stage_type, stage_status, stage_data, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                stage.stage_id.to_string(),
                stage.session_id.to_string(),
                stage.stage_type.as_str(),
                stage.stage_status.to_string(),
                stage.stage_data,
                chrono::Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StorageError::Duplicate(format!("{} stage for {}", stage.stage_type, stage.session_id));
            }
            db_err(e)
        })?;
        Ok(())
    }

    // Synchronous helper methods for the trait implementations

    fn get_user_by_email_sync(&self, email: &str) -> Result<Option<User>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT user_id, email, created_at FROM users WHERE email = ?1",
            params![email],
            |row| Self::row_to_user(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn query_wallet(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<Wallet>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM wallets WHERE {}", WALLET_COLUMNS, filter),
            args,
            |row| Self::row_to_wallet(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn create_keygen_sync(&self, record: &KeygenRecord) -> Result<User, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let existing = tx
            .query_row(
                "SELECT user_id, email, created_at FROM users WHERE email = ?1",
                params![record.email],
                |row| Self::row_to_user(row),
            )
            .optional()
            .map_err(db_err)?;

        let user = match existing {
            Some(user) => user,
            None => {
                let user = User {
                    user_id: Uuid::new_v4(),
                    email: record.email.clone(),
                    created_at: chrono::Utc::now(),
                };
                tx.execute(
                    "INSERT INTO users (user_id, email, created_at) VALUES (?1, ?2, ?3)",
                    params![user.user_id.to_string(), user.email, millis(&user.created_at)],
                )
                .map_err(db_err)?;
                user
            }
        };

        let now = millis(&chrono::Utc::now());
        for wallet in &record.wallets {
            tx.execute(
                &format!(
                    "INSERT INTO wallets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    WALLET_COLUMNS
                ),
                params![
                    wallet.wallet_id.to_string(),
                    user.user_id.to_string(),
                    wallet.curve_type.as_str(),
                    wallet.public_key,
                    wallet.enc_tss_share,
                    i64::from(wallet.sss_threshold),
                    WALLET_STATUS_ACTIVE,
                    now,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return StorageError::Duplicate(format!("{} wallet {}", wallet.curve_type, wallet.public_key));
                }
                db_err(e)
            })?;
        }

        Self::insert_session_tx(&tx, &record.session)?;
        Self::insert_stage_tx(&tx, &record.stage)?;
        tx.commit().map_err(db_err)?;

        Ok(user)
    }

    fn create_session_sync(&self, session: &TssSession, stage: &TssStage) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        Self::insert_session_tx(&tx, session)?;
        Self::insert_stage_tx(&tx, stage)?;
        tx.commit().map_err(db_err)
    }

    fn insert_stage_sync(&self, stage: &TssStage) -> Result<(), StorageError> {
        let conn = self.conn()?;
        Self::insert_stage_tx(&conn, stage)
    }

    fn get_session_sync(&self, session_id: Uuid) -> Result<Option<TssSession>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT session_id, wallet_id, customer_id, created_at FROM tss_sessions WHERE session_id = ?1",
            params![session_id.to_string()],
            |row| Self::row_to_session(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn get_stage_sync(&self, session_id: Uuid, stage_type: StageType) -> Result<Option<TssStage>, StorageError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT stage_id, session_id, stage_type, stage_status, stage_data
            FROM tss_stages WHERE session_id = ?1 AND stage_type = ?2
            "#,
            params![session_id.to_string(), stage_type.as_str()],
            |row| Self::row_to_stage(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn transition_stage_sync(
        &self,
        session_id: Uuid,
        stage_type: StageType,
        expected: StageStatus,
        next: StageStatus,
        stage_data: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
                UPDATE tss_stages SET stage_status = ?1, stage_data = ?2, updated_at = ?3
                WHERE session_id = ?4 AND stage_type = ?5 AND stage_status = ?6
                "#,
                params![
                    next.to_string(),
                    stage_data,
                    chrono::Utc::now().timestamp_millis(),
                    session_id.to_string(),
                    stage_type.as_str(),
                    expected.to_string(),
                ],
            )
            .map_err(db_err)?;

        if rows_affected == 0 {
            return Err(StorageError::Conflict(format!(
                "{} stage of {} is not at {}",
                stage_type, session_id, expected
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TssStore for SqliteTssStore {
    async fn get_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        self.get_user_by_email_sync(email)
    }

    async fn get_wallet(&self, wallet_id: Uuid) -> StorageResult<Option<Wallet>> {
        self.query_wallet("wallet_id = ?1", &[&wallet_id.to_string()])
    }

    async fn get_wallet_by_user_curve(&self, user_id: Uuid, curve: CurveType) -> StorageResult<Option<Wallet>> {
        self.query_wallet(
            "user_id = ?1 AND curve_type = ?2",
            &[&user_id.to_string(), &curve.as_str()],
        )
    }

    async fn get_wallet_by_public_key(&self, curve: CurveType, public_key: &str) -> StorageResult<Option<Wallet>> {
        self.query_wallet(
            "curve_type = ?1 AND public_key = ?2",
            &[&curve.as_str(), &public_key],
        )
    }

    async fn create_keygen(&self, record: &KeygenRecord) -> StorageResult<User> {
        self.create_keygen_sync(record)
    }

    async fn create_session(&self, session: &TssSession, stage: &TssStage) -> StorageResult<()> {
        self.create_session_sync(session, stage)
    }

    async fn insert_stage(&self, stage: &TssStage) -> StorageResult<()> {
        self.insert_stage_sync(stage)
    }

    async fn get_session(&self, session_id: Uuid) -> StorageResult<Option<TssSession>> {
        self.get_session_sync(session_id)
    }

    async fn get_stage(&self, session_id: Uuid, stage_type: StageType) -> StorageResult<Option<TssStage>> {
        self.get_stage_sync(session_id, stage_type)
    }

    async fn transition_stage(
        &self,
        session_id: Uuid,
        stage_type: StageType,
        expected: StageStatus,
        next: StageStatus,
        stage_data: &str,
    ) -> StorageResult<()> {
        self.transition_stage_sync(session_id, stage_type, expected, next, stage_data)
    }
}
