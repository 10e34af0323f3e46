use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Credits a new user starts with.
pub const SIGNUP_BONUS: i64 = 1;
/// Credits the inviter earns for each new user.
pub const INVITE_REWARD: i64 = 2;
/// Credits granted by a daily check-in.
pub const CHECKIN_REWARD: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub user_id: u64,
    pub username: Option<String>,
    pub full_name: String,
    pub balance: i64,
    pub is_blocked: bool,
    pub invited_by: Option<u64>,
    pub last_checkin: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardKey {
    pub key_code: String,
    pub balance: i64,
    pub max_uses: i64,
    pub current_uses: i64,
    pub expire_at: Option<String>,
    pub created_at: String,
}

/// Why a card key could not be redeemed.
#[derive(Debug, Clone, PartialEq)]
pub enum Redemption {
    Redeemed { balance: i64 },
    NotFound,
    Expired,
    Exhausted,
    AlreadyUsed,
    /// Crediting the key would overflow the user's balance.
    BalanceOverflow,
}

/// Result of an admin balance adjustment.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceUpdate {
    Applied { balance: i64 },
    UnknownUser,
    /// The new balance would be negative or overflow.
    OutOfRange,
}

/// Expiry timestamp `days` from now, or None if it is not representable.
pub fn expiry_after(days: i64) -> Option<DateTime<Utc>> {
    Utc::now().checked_add_signed(TimeDelta::try_days(days)?)
}

/// Thread-safe SQLite handle shared by all command handlers.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        // Migrations run on the raw connection before it goes behind the async Mutex.
        Self::run_migrations(&conn)?;

        info!("Database initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id      INTEGER PRIMARY KEY,
                username     TEXT,
                full_name    TEXT NOT NULL DEFAULT '',
                balance      INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                is_blocked   INTEGER NOT NULL DEFAULT 0,
                invited_by   INTEGER,
                last_checkin TEXT,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS card_keys (
                key_code     TEXT PRIMARY KEY,
                balance      INTEGER NOT NULL,
                max_uses     INTEGER NOT NULL DEFAULT 1,
                current_uses INTEGER NOT NULL DEFAULT 0,
                expire_at    TEXT,
                created_by   INTEGER NOT NULL,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS card_key_usage (
                key_code TEXT NOT NULL REFERENCES card_keys(key_code),
                user_id  INTEGER NOT NULL,
                used_at  TEXT NOT NULL,
                PRIMARY KEY (key_code, user_id)
            );",
        )
        .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Insert a user if unknown. Returns true when the user is new; the
    /// inviter is rewarded only then.
    pub async fn create_user(
        &self,
        user_id: u64,
        username: Option<&str>,
        full_name: &str,
        invited_by: Option<u64>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let invited_by = invited_by.filter(|inviter| *inviter != user_id);
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO users (user_id, username, full_name, balance, invited_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user_id as i64,
                    username,
                    full_name,
                    SIGNUP_BONUS,
                    invited_by.map(|id| id as i64),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert user")?;
        if inserted == 1 {
            if let Some(inviter) = invited_by {
                tx.execute(
                    "UPDATE users SET balance = balance + ?1
                     WHERE user_id = ?2 AND balance <= ?3 - ?1",
                    rusqlite::params![INVITE_REWARD, inviter as i64, i64::MAX],
                )
                .context("Failed to reward inviter")?;
            }
        }
        tx.commit()?;
        Ok(inserted == 1)
    }

    pub async fn get_user(&self, user_id: u64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, username, full_name, balance, is_blocked, invited_by, last_checkin
             FROM users WHERE user_id = ?1",
            rusqlite::params![user_id as i64],
            |row| {
                Ok(UserRecord {
                    user_id: row.get::<_, i64>(0)? as u64,
                    username: row.get(1)?,
                    full_name: row.get(2)?,
                    balance: row.get(3)?,
                    is_blocked: row.get(4)?,
                    invited_by: row.get::<_, Option<i64>>(5)?.map(|id| id as u64),
                    last_checkin: row.get(6)?,
                })
            },
        )
        .optional()
        .context("Failed to query user")
    }

    pub async fn is_user_blocked(&self, user_id: u64) -> Result<bool> {
        Ok(self
            .get_user(user_id)
            .await?
            .map(|user| user.is_blocked)
            .unwrap_or(false))
    }

    /// Add (or with a negative amount, remove) credits. The balance never goes
    /// negative and never leaves the INTEGER range.
    pub async fn add_balance(&self, user_id: u64, amount: i64) -> Result<BalanceUpdate> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT balance FROM users WHERE user_id = ?1",
                rusqlite::params![user_id as i64],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read balance")?;
        let Some(current) = current else {
            return Ok(BalanceUpdate::UnknownUser);
        };
        let Some(balance) = current.checked_add(amount).filter(|b| *b >= 0) else {
            return Ok(BalanceUpdate::OutOfRange);
        };
        tx.execute(
            "UPDATE users SET balance = ?1 WHERE user_id = ?2",
            rusqlite::params![balance, user_id as i64],
        )
        .context("Failed to update balance")?;
        tx.commit()?;
        Ok(BalanceUpdate::Applied { balance })
    }

    /// Check in for `today`. Returns false if the user already checked in that day.
    pub async fn checkin(&self, user_id: u64, today: NaiveDate) -> Result<bool> {
        let today = today.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE users SET balance = balance + ?1, last_checkin = ?2
                 WHERE user_id = ?3 AND (last_checkin IS NULL OR last_checkin <> ?2)
                   AND balance <= ?4 - ?1",
                rusqlite::params![CHECKIN_REWARD, today, user_id as i64, i64::MAX],
            )
            .context("Failed to check in")?;
        Ok(updated == 1)
    }

    /// Returns false if the user is unknown.
    pub async fn set_blocked(&self, user_id: u64, blocked: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE users SET is_blocked = ?1 WHERE user_id = ?2",
                rusqlite::params![blocked, user_id as i64],
            )
            .context("Failed to update block flag")?;
        Ok(updated == 1)
    }

    pub async fn blocked_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, username, full_name, balance, is_blocked, invited_by, last_checkin
                 FROM users WHERE is_blocked = 1 ORDER BY user_id ASC",
            )
            .context("Failed to prepare blacklist query")?;
        let users = stmt
            .query_map([], |row| {
                Ok(UserRecord {
                    user_id: row.get::<_, i64>(0)? as u64,
                    username: row.get(1)?,
                    full_name: row.get(2)?,
                    balance: row.get(3)?,
                    is_blocked: row.get(4)?,
                    invited_by: row.get::<_, Option<i64>>(5)?.map(|id| id as u64),
                    last_checkin: row.get(6)?,
                })
            })
            .context("Failed to map rows")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect rows")?;
        Ok(users)
    }

    /// Ids of every user who is not blocked.
    pub async fn active_user_ids(&self) -> Result<Vec<u64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT user_id FROM users WHERE is_blocked = 0 ORDER BY user_id ASC")
            .context("Failed to prepare user id query")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to map rows")?
            .map(|id| id.map(|id| id as u64))
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect rows")?;
        Ok(ids)
    }

    pub async fn count_invites(&self, user_id: u64) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE invited_by = ?1",
                rusqlite::params![user_id as i64],
                |row| row.get(0),
            )
            .context("Failed to count invites")?;
        Ok(count)
    }

    pub async fn create_card_key(
        &self,
        key_code: &str,
        balance: i64,
        max_uses: i64,
        expire_at: Option<DateTime<Utc>>,
        created_by: u64,
    ) -> Result<CardKey> {
        if balance <= 0 || max_uses <= 0 {
            bail!("Card key balance and max uses must be positive");
        }
        let now = Utc::now();
        let key = CardKey {
            key_code: key_code.to_string(),
            balance,
            max_uses,
            current_uses: 0,
            expire_at: expire_at.map(|at| at.to_rfc3339()),
            created_at: now.to_rfc3339(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO card_keys (key_code, balance, max_uses, current_uses, expire_at, created_by, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
            rusqlite::params![
                key.key_code,
                key.balance,
                key.max_uses,
                key.expire_at,
                created_by as i64,
                key.created_at,
            ],
        )
        .with_context(|| format!("Failed to insert card key {}", key_code))?;
        Ok(key)
    }

    /// Redeem a key in one transaction: expiry, total uses and per-user
    /// single use are all checked against the same snapshot.
    pub async fn use_card_key(&self, key_code: &str, user_id: u64) -> Result<Redemption> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let key: Option<(i64, i64, i64, Option<String>)> = tx
            .query_row(
                "SELECT balance, max_uses, current_uses, expire_at FROM card_keys WHERE key_code = ?1",
                rusqlite::params![key_code],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((balance, max_uses, current_uses, expire_at)) = key else {
            return Ok(Redemption::NotFound);
        };

        if let Some(expire_at) = expire_at {
            let expire_at = chrono::DateTime::parse_from_rfc3339(&expire_at)
                .with_context(|| format!("Corrupt expiry on key {}", key_code))?;
            if expire_at < Utc::now() {
                return Ok(Redemption::Expired);
            }
        }
        let used_before: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM card_key_usage WHERE key_code = ?1 AND user_id = ?2)",
            rusqlite::params![key_code, user_id as i64],
            |row| row.get(0),
        )?;
        if used_before {
            return Ok(Redemption::AlreadyUsed);
        }
        if current_uses >= max_uses {
            return Ok(Redemption::Exhausted);
        }
        let current: Option<i64> = tx
            .query_row(
                "SELECT balance FROM users WHERE user_id = ?1",
                rusqlite::params![user_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            bail!("User {} is not registered", user_id);
        };
        let Some(new_balance) = current.checked_add(balance) else {
            return Ok(Redemption::BalanceOverflow);
        };

        tx.execute(
            "INSERT INTO card_key_usage (key_code, user_id, used_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key_code, user_id as i64, Utc::now().to_rfc3339()],
        )?;

        tx.execute(
            "UPDATE card_keys SET current_uses = current_uses + 1 WHERE key_code = ?1",
            rusqlite::params![key_code],
        )?;
        tx.execute(
            "UPDATE users SET balance = ?1 WHERE user_id = ?2",
            rusqlite::params![new_balance, user_id as i64],
        )?;
        tx.commit().context("Failed to commit key redemption")?;
        Ok(Redemption::Redeemed { balance })
    }

    pub async fn list_card_keys(&self) -> Result<Vec<CardKey>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT key_code, balance, max_uses, current_uses, expire_at, created_at
                 FROM card_keys ORDER BY created_at DESC",
            )
            .context("Failed to prepare card key query")?;
        let keys = stmt
            .query_map([], |row| {
                Ok(CardKey {
                    key_code: row.get(0)?,
                    balance: row.get(1)?,
                    max_uses: row.get(2)?,
                    current_uses: row.get(3)?,
                    expire_at: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to map rows")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect rows")?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    #[tokio::test]
    async fn test_create_user_rewards_inviter_once() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.create_user(1, Some("alice"), "Alice", None).await.unwrap());
        assert!(db.create_user(2, None, "Bob", Some(1)).await.unwrap());
        assert!(!db.create_user(2, None, "Bob", Some(1)).await.unwrap());

        let alice = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(alice.balance, SIGNUP_BONUS + INVITE_REWARD);
        assert_eq!(db.count_invites(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_self_invite_ignored() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(7, None, "Seven", Some(7)).await.unwrap();
        let user = db.get_user(7).await.unwrap().unwrap();
        assert_eq!(user.invited_by, None);
        assert_eq!(user.balance, SIGNUP_BONUS);
    }

    #[tokio::test]
    async fn test_checkin_once_per_day() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(1, None, "A", None).await.unwrap();

        assert!(db.checkin(1, day(1)).await.unwrap());
        assert!(!db.checkin(1, day(1)).await.unwrap());
        assert!(db.checkin(1, day(2)).await.unwrap());

        let user = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.balance, SIGNUP_BONUS + 2 * CHECKIN_REWARD);
        assert_eq!(user.last_checkin.as_deref(), Some("2026-01-02"));
    }

    #[tokio::test]
    async fn test_concurrent_checkins_credit_once() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(1, None, "A", None).await.unwrap();

        let attempts = (0..8).map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.checkin(1, day(3)).await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;
        let successes = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_add_balance_unknown_user() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.add_balance(99, 5).await.unwrap(), BalanceUpdate::UnknownUser);
    }

    #[tokio::test]
    async fn test_add_balance_stays_in_range() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(1, None, "A", None).await.unwrap();

        assert_eq!(
            db.add_balance(1, i64::MAX).await.unwrap(),
            BalanceUpdate::OutOfRange
        );
        assert_eq!(
            db.add_balance(1, -(SIGNUP_BONUS + 1)).await.unwrap(),
            BalanceUpdate::OutOfRange
        );
        assert_eq!(
            db.add_balance(1, i64::MAX - SIGNUP_BONUS).await.unwrap(),
            BalanceUpdate::Applied { balance: i64::MAX }
        );

        // Rewards at the ceiling are skipped instead of overflowing.
        assert!(!db.checkin(1, day(1)).await.unwrap());
        db.create_user(2, None, "B", Some(1)).await.unwrap();
        db.create_card_key("BIG", 5, 1, None, 1).await.unwrap();
        assert_eq!(
            db.use_card_key("BIG", 1).await.unwrap(),
            Redemption::BalanceOverflow
        );

        let user = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.balance, i64::MAX);
        assert_eq!(db.list_card_keys().await.unwrap()[0].current_uses, 0);
    }

    #[test]
    fn test_expiry_after_rejects_unrepresentable_days() {
        assert!(expiry_after(7).is_some_and(|at| at > Utc::now()));
        assert_eq!(expiry_after(100_000_000), None);
        assert_eq!(expiry_after(i64::MAX), None);
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(1, None, "A", None).await.unwrap();
        db.create_user(2, None, "B", None).await.unwrap();

        assert!(db.set_blocked(2, true).await.unwrap());
        assert!(db.is_user_blocked(2).await.unwrap());
        assert_eq!(db.blocked_users().await.unwrap().len(), 1);
        assert_eq!(db.active_user_ids().await.unwrap(), vec![1]);

        assert!(db.set_blocked(2, false).await.unwrap());
        assert!(db.blocked_users().await.unwrap().is_empty());
        assert!(!db.set_blocked(3, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_card_key_single_use_per_user() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(1, None, "A", None).await.unwrap();
        db.create_user(2, None, "B", None).await.unwrap();
        db.create_user(3, None, "C", None).await.unwrap();
        db.create_card_key("KEY-1", 10, 2, None, 1).await.unwrap();

        assert_eq!(
            db.use_card_key("KEY-1", 1).await.unwrap(),
            Redemption::Redeemed { balance: 10 }
        );
        assert_eq!(
            db.use_card_key("KEY-1", 1).await.unwrap(),
            Redemption::AlreadyUsed
        );
        assert_eq!(
            db.use_card_key("KEY-1", 2).await.unwrap(),
            Redemption::Redeemed { balance: 10 }
        );
        assert_eq!(
            db.use_card_key("KEY-1", 3).await.unwrap(),
            Redemption::Exhausted
        );
        assert_eq!(
            db.use_card_key("NOPE", 3).await.unwrap(),
            Redemption::NotFound
        );

        let keys = db.list_card_keys().await.unwrap();
        assert_eq!(keys[0].current_uses, 2);
        assert_eq!(db.get_user(1).await.unwrap().unwrap().balance, SIGNUP_BONUS + 10);
    }

    #[tokio::test]
    async fn test_expired_card_key() {
        let db = Database::open_in_memory().unwrap();
        db.create_user(1, None, "A", None).await.unwrap();
        db.create_card_key("OLD", 5, 1, expiry_after(-1), 1).await.unwrap();
        assert_eq!(db.use_card_key("OLD", 1).await.unwrap(), Redemption::Expired);
    }
}
