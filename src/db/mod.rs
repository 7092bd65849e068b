//! Durable state needed to resume after a restart.
//!
//! Stores:
//! - The last issued call identifier per account
//! - Every open position per account
//! - Replication outcomes (audit trail and idempotency key)
//! - The signal journal backing at-least-once replication

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::PersistenceError;
use crate::models::{AccountId, Position, ReplicationOutcome, ReplicationResult, TradeSignal};

/// Storage contract required by the core. Every write must be durable when
/// the returned future resolves.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_nonce(&self, account: &AccountId) -> Result<Option<u64>, PersistenceError>;

    async fn save_nonce(&self, account: &AccountId, nonce: u64) -> Result<(), PersistenceError>;

    async fn load_positions(&self, account: &AccountId) -> Result<Vec<Position>, PersistenceError>;

    async fn save_position(&self, position: &Position) -> Result<(), PersistenceError>;

    async fn delete_position(&self, account: &AccountId, symbol: &str)
        -> Result<(), PersistenceError>;

    async fn has_outcome(
        &self,
        order_id: &str,
        follower: &AccountId,
    ) -> Result<bool, PersistenceError>;

    /// Returns false when an outcome for (order_id, follower) already existed.
    async fn save_outcome(&self, outcome: &ReplicationOutcome) -> Result<bool, PersistenceError>;

    async fn journal_signal(&self, signal: &TradeSignal) -> Result<(), PersistenceError>;

    async fn complete_signal(&self, order_id: &str) -> Result<(), PersistenceError>;

    /// Journaled signals whose fan-out never completed, oldest first.
    async fn pending_signals(&self) -> Result<Vec<TradeSignal>, PersistenceError>;
}

/// SQLite-backed state store.
pub struct Database {
    pool: SqlitePool,
}

/// Stored replication outcome record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOutcome {
    pub id: String,
    pub order_id: String,
    pub follower_id: String,
    pub symbol: String,
    pub side: String,
    pub follower_size: String,
    pub status: String,
    pub detail: String,
    pub created_at: String,
}

/// Stored call identifier record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredNonce {
    pub account_id: String,
    pub last_nonce: i64,
    pub updated_at: String,
}

impl Database {
    /// Open a database from a URL such as `sqlite:./copyguard.db`.
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect(options).await
    }

    /// Open (creating if needed) a database file.
    pub async fn open_path(path: &Path) -> Result<Self, PersistenceError> {
        Self::connect(SqliteConnectOptions::new().filename(path)).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, PersistenceError> {
        // FULL sync: a returned write has reached disk.
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_nonces (
                account_id TEXT PRIMARY KEY,
                last_nonce INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                state TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account_id, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_outcomes (
                id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                follower_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                follower_size TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (order_id, follower_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_journal (
                order_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outcomes_created ON replication_outcomes(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signal_journal_status ON signal_journal(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Reporting ====================

    /// Last persisted identifier for every account.
    pub async fn all_nonces(&self) -> Result<Vec<StoredNonce>, PersistenceError> {
        Ok(sqlx::query_as::<_, StoredNonce>(
            "SELECT account_id, last_nonce, updated_at FROM account_nonces ORDER BY account_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Every persisted position across accounts.
    pub async fn all_positions(&self) -> Result<Vec<Position>, PersistenceError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM positions ORDER BY account_id, symbol")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(PersistenceError::from))
            .collect()
    }

    /// Most recent replication outcomes.
    pub async fn recent_outcomes(&self, limit: i64) -> Result<Vec<StoredOutcome>, PersistenceError> {
        Ok(sqlx::query_as::<_, StoredOutcome>(
            "SELECT * FROM replication_outcomes ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl StateStore for Database {
    async fn load_nonce(&self, account: &AccountId) -> Result<Option<u64>, PersistenceError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_nonce FROM account_nonces WHERE account_id = ?")
                .bind(account.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(n,)| {
            u64::try_from(n).map_err(|_| {
                PersistenceError::Corrupt(format!("negative nonce {} for {}", n, account))
            })
        })
        .transpose()
    }

    async fn save_nonce(&self, account: &AccountId, nonce: u64) -> Result<(), PersistenceError> {
        let value = i64::try_from(nonce)
            .map_err(|_| PersistenceError::Corrupt(format!("nonce {} out of range", nonce)))?;

        // MAX keeps the stored value from ever regressing.
        sqlx::query(
            r#"
            INSERT INTO account_nonces (account_id, last_nonce, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(account_id) DO UPDATE SET
                last_nonce = MAX(account_nonces.last_nonce, excluded.last_nonce),
                updated_at = datetime('now')
            "#,
        )
        .bind(account.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_positions(&self, account: &AccountId) -> Result<Vec<Position>, PersistenceError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM positions WHERE account_id = ? ORDER BY symbol")
                .bind(account.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(PersistenceError::from))
            .collect()
    }

    async fn save_position(&self, position: &Position) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(position)?;

        sqlx::query(
            r#"
            INSERT INTO positions (account_id, symbol, state, payload, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            ON CONFLICT(account_id, symbol) DO UPDATE SET
                state = excluded.state,
                payload = excluded.payload,
                updated_at = datetime('now')
            "#,
        )
        .bind(position.account_id.as_str())
        .bind(&position.symbol)
        .bind(position.state.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_position(
        &self,
        account: &AccountId,
        symbol: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM positions WHERE account_id = ? AND symbol = ?")
            .bind(account.as_str())
            .bind(symbol)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn has_outcome(
        &self,
        order_id: &str,
        follower: &AccountId,
    ) -> Result<bool, PersistenceError> {
        let result: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM replication_outcomes WHERE order_id = ? AND follower_id = ?",
        )
        .bind(order_id)
        .bind(follower.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.is_some())
    }

    async fn save_outcome(&self, outcome: &ReplicationOutcome) -> Result<bool, PersistenceError> {
        let detail = serde_json::to_string(&outcome.result)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO replication_outcomes (
                id, order_id, follower_id, symbol, side,
                follower_size, status, detail, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&outcome.id)
        .bind(&outcome.order_id)
        .bind(outcome.follower_id.as_str())
        .bind(&outcome.symbol)
        .bind(outcome.side.as_str())
        .bind(outcome.follower_size.to_string())
        .bind(outcome.result.status_str())
        .bind(detail)
        .bind(outcome.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn journal_signal(&self, signal: &TradeSignal) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(signal)?;

        sqlx::query(
            "INSERT OR IGNORE INTO signal_journal (order_id, payload, status) VALUES (?, ?, 'pending')",
        )
        .bind(&signal.order_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        debug!(order_id = %signal.order_id, "Signal journaled");
        Ok(())
    }

    async fn complete_signal(&self, order_id: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE signal_journal SET status = 'done', completed_at = datetime('now') WHERE order_id = ?",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_signals(&self) -> Result<Vec<TradeSignal>, PersistenceError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM signal_journal WHERE status = 'pending' ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(PersistenceError::from))
            .collect()
    }
}

impl StoredOutcome {
    pub fn size(&self) -> Decimal {
        Decimal::from_str(&self.follower_size).unwrap_or(Decimal::ZERO)
    }

    pub fn result(&self) -> Option<ReplicationResult> {
        serde_json::from_str(&self.detail).ok()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_database;
    use super::*;
    use crate::models::{
        OrderStatus, PositionSide, ProtectiveLevels, ReplicationResult, SizeType, SkipReason,
        TradeSide,
    };
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_nonce_never_regresses() {
        let (_dir, db) = temp_database().await;
        let account = AccountId::new("master");

        assert_eq!(db.load_nonce(&account).await.unwrap(), None);

        db.save_nonce(&account, 500).await.unwrap();
        db.save_nonce(&account, 400).await.unwrap();

        assert_eq!(db.load_nonce(&account).await.unwrap(), Some(500));
    }

    #[tokio::test]
    async fn test_position_roundtrip_and_delete() {
        let (_dir, db) = temp_database().await;
        let account = AccountId::new("f1");
        let position = Position::open(
            account.clone(),
            "BTC-USD".to_string(),
            PositionSide::Long,
            dec!(0.5),
            dec!(60000),
            Utc::now(),
            ProtectiveLevels {
                stop_price: dec!(57000),
                targets: vec![],
            },
        );

        db.save_position(&position).await.unwrap();
        let loaded = db.load_positions(&account).await.unwrap();
        assert_eq!(loaded, vec![position]);

        db.delete_position(&account, "BTC-USD").await.unwrap();
        assert!(db.load_positions(&account).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outcome_insert_is_idempotent() {
        let (_dir, db) = temp_database().await;
        let follower = AccountId::new("f1");
        let outcome = ReplicationOutcome::new(
            "order-1",
            follower.clone(),
            "BTC-USD",
            TradeSide::Buy,
            dec!(1),
            ReplicationResult::Skipped {
                reason: SkipReason::BelowMinimum,
            },
        );

        assert!(db.save_outcome(&outcome).await.unwrap());
        assert!(!db.save_outcome(&outcome).await.unwrap());
        assert!(db.has_outcome("order-1", &follower).await.unwrap());

        let stored = db.recent_outcomes(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, "SKIPPED");
        assert_eq!(stored[0].size(), dec!(1));
    }

    #[tokio::test]
    async fn test_signal_journal_tracks_pending() {
        let (_dir, db) = temp_database().await;
        let signal = TradeSignal {
            order_id: "m-1".to_string(),
            master_account: AccountId::new("master"),
            symbol: "ETH-USD".to_string(),
            side: TradeSide::Buy,
            filled_quantity: dec!(2),
            fill_price: dec!(3000),
            size_type: SizeType::Base,
            master_balance: dec!(10000),
            status: OrderStatus::Filled,
            filled_at: Utc::now(),
            reduces_position: false,
        };

        db.journal_signal(&signal).await.unwrap();
        db.journal_signal(&signal).await.unwrap();
        assert_eq!(db.pending_signals().await.unwrap(), vec![signal.clone()]);

        db.complete_signal("m-1").await.unwrap();
        assert!(db.pending_signals().await.unwrap().is_empty());
    }
}
