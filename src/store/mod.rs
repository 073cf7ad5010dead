//! SQLite system of record for "what we last saw".
//!
//! Data model:
//!   poll_state(key)                      → string value (RFC3339 timestamps, small scalars)
//!   seen_markers(scope, subject_id)      → presence, one scope per job
//!   specialization_top(item)             → long-term leader per category
//!   deposit_top(item)                    → short-term leader per category
//!   citizen_levels(user_id)              → level cache, replaced per group
//!   luck_scores(user_id)                 → score cache, upserted per sweep
//!
//! Every write is committed before the call returns. Large sweeps batch
//! their rows through explicit flushes (see [`CitizenWriter`] and
//! [`Store::upsert_scores`]); each flush is one transaction.

mod citizens;
mod scores;

pub use citizens::{CitizenRecord, CitizenWriter, SkillMode};
pub use scores::ScoreRecord;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::Row;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt value in {0}")]
    Corrupt(String),
    #[error("store directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS poll_state (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS seen_markers (
        scope      TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        seen_at    TEXT NOT NULL,
        PRIMARY KEY (scope, subject_id)
    )",
    "CREATE TABLE IF NOT EXISTS specialization_top (
        item            TEXT PRIMARY KEY,
        subject_id      TEXT NOT NULL,
        subject_name    TEXT NOT NULL,
        score           REAL NOT NULL,
        strategic       REAL NOT NULL,
        specialization  REAL NOT NULL,
        ethic           REAL NOT NULL,
        announced_score REAL NOT NULL,
        updated_at      TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS deposit_top (
        item          TEXT PRIMARY KEY,
        region_id     TEXT NOT NULL,
        region_name   TEXT NOT NULL,
        subject_id    TEXT NOT NULL,
        subject_name  TEXT NOT NULL,
        score         REAL NOT NULL,
        deposit_bonus REAL NOT NULL,
        ethic_bonus   REAL NOT NULL,
        ends_at       TEXT,
        updated_at    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS citizen_levels (
        user_id      TEXT PRIMARY KEY,
        group_id     TEXT NOT NULL,
        level        INTEGER NOT NULL,
        citizen_name TEXT,
        skill_mode   TEXT,
        updated_at   TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_citizen_levels_group ON citizen_levels(group_id)",
    "CREATE TABLE IF NOT EXISTS luck_scores (
        user_id      TEXT PRIMARY KEY,
        group_id     TEXT NOT NULL,
        display_name TEXT NOT NULL,
        score        REAL NOT NULL,
        sample_size  INTEGER NOT NULL,
        updated_at   TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_luck_scores_group ON luck_scores(group_id)",
];

/// Long-term leader of one category.
#[derive(Debug, Clone, PartialEq)]
pub struct LongTermLeader {
    pub item: String,
    pub subject_id: String,
    pub subject_name: String,
    /// Latest computed total, rewritten every sweep.
    pub score: f64,
    pub strategic: f64,
    pub specialization: f64,
    pub ethic: f64,
    /// Total at the last emitted change; the epsilon baseline.
    pub announced_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Short-term (time-bounded) leader of one category.
#[derive(Debug, Clone, PartialEq)]
pub struct ShortTermLeader {
    pub item: String,
    pub region_id: String,
    pub region_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub score: f64,
    pub deposit_bonus: f64,
    pub ethic_bonus: f64,
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(path = path, "store opened");
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees it.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─── PollState ───────────────────────────────────────────────────────────

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM poll_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("value")?),
            None => None,
        })
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO poll_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        debug!(key = key, "poll state written");
        Ok(())
    }

    pub async fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.get_state(key).await? {
            Some(raw) => parse_ts(&raw, key).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.set_state(key, &at.to_rfc3339()).await
    }

    // ─── Seen markers ───────────────────────────────────────────────────────

    /// Idempotent: marking twice is the same as marking once.
    pub async fn mark_seen(&self, scope: &str, subject_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO seen_markers (scope, subject_id, seen_at) VALUES (?, ?, ?)
             ON CONFLICT(scope, subject_id) DO NOTHING",
        )
        .bind(scope)
        .bind(subject_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn has_seen(&self, scope: &str, subject_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM seen_markers WHERE scope = ? AND subject_id = ?")
            .bind(scope)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn count_seen(&self, scope: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM seen_markers WHERE scope = ?")
            .bind(scope)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Forget every marker of one scope. Returns the number removed.
    pub async fn reset_seen(&self, scope: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM seen_markers WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        info!(scope = scope, removed = done.rows_affected(), "seen markers reset");
        Ok(done.rows_affected())
    }

    // ─── Long-term leaders ──────────────────────────────────────────────────

    pub async fn get_long_term(&self, item: &str) -> Result<Option<LongTermLeader>> {
        let row = sqlx::query("SELECT * FROM specialization_top WHERE item = ?")
            .bind(item)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| long_term_from_row(&r)).transpose()
    }

    pub async fn list_long_term(&self) -> Result<Vec<LongTermLeader>> {
        let rows = sqlx::query("SELECT * FROM specialization_top ORDER BY item")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(long_term_from_row).collect()
    }

    pub async fn set_long_term(&self, rec: &LongTermLeader) -> Result<()> {
        sqlx::query(
            "INSERT INTO specialization_top
                (item, subject_id, subject_name, score, strategic, specialization, ethic, announced_score, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(item) DO UPDATE SET
                subject_id = excluded.subject_id,
                subject_name = excluded.subject_name,
                score = excluded.score,
                strategic = excluded.strategic,
                specialization = excluded.specialization,
                ethic = excluded.ethic,
                announced_score = excluded.announced_score,
                updated_at = excluded.updated_at",
        )
        .bind(&rec.item)
        .bind(&rec.subject_id)
        .bind(&rec.subject_name)
        .bind(rec.score)
        .bind(rec.strategic)
        .bind(rec.specialization)
        .bind(rec.ethic)
        .bind(rec.announced_score)
        .bind(rec.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_long_term(&self, item: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM specialization_top WHERE item = ?")
            .bind(item)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ─── Short-term leaders ─────────────────────────────────────────────────

    pub async fn get_short_term(&self, item: &str) -> Result<Option<ShortTermLeader>> {
        let row = sqlx::query("SELECT * FROM deposit_top WHERE item = ?")
            .bind(item)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| short_term_from_row(&r)).transpose()
    }

    pub async fn list_short_term(&self) -> Result<Vec<ShortTermLeader>> {
        let rows = sqlx::query("SELECT * FROM deposit_top ORDER BY item")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(short_term_from_row).collect()
    }

    pub async fn set_short_term(&self, rec: &ShortTermLeader) -> Result<()> {
        sqlx::query(
            "INSERT INTO deposit_top
                (item, region_id, region_name, subject_id, subject_name, score, deposit_bonus, ethic_bonus, ends_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(item) DO UPDATE SET
                region_id = excluded.region_id,
                region_name = excluded.region_name,
                subject_id = excluded.subject_id,
                subject_name = excluded.subject_name,
                score = excluded.score,
                deposit_bonus = excluded.deposit_bonus,
                ethic_bonus = excluded.ethic_bonus,
                ends_at = excluded.ends_at,
                updated_at = excluded.updated_at",
        )
        .bind(&rec.item)
        .bind(&rec.region_id)
        .bind(&rec.region_name)
        .bind(&rec.subject_id)
        .bind(&rec.subject_name)
        .bind(rec.score)
        .bind(rec.deposit_bonus)
        .bind(rec.ethic_bonus)
        .bind(rec.ends_at.map(|t| t.to_rfc3339()))
        .bind(rec.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_short_term(&self, item: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM deposit_top WHERE item = ?")
            .bind(item)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

pub(crate) fn parse_ts(raw: &str, what: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt(format!("{what}: bad timestamp {raw:?}")))
}

fn long_term_from_row(r: &SqliteRow) -> Result<LongTermLeader> {
    let updated: String = r.try_get("updated_at")?;
    Ok(LongTermLeader {
        item: r.try_get("item")?,
        subject_id: r.try_get("subject_id")?,
        subject_name: r.try_get("subject_name")?,
        score: r.try_get("score")?,
        strategic: r.try_get("strategic")?,
        specialization: r.try_get("specialization")?,
        ethic: r.try_get("ethic")?,
        announced_score: r.try_get("announced_score")?,
        updated_at: parse_ts(&updated, "specialization_top.updated_at")?,
    })
}

fn short_term_from_row(r: &SqliteRow) -> Result<ShortTermLeader> {
    let updated: String = r.try_get("updated_at")?;
    let ends: Option<String> = r.try_get("ends_at")?;
    Ok(ShortTermLeader {
        item: r.try_get("item")?,
        region_id: r.try_get("region_id")?,
        region_name: r.try_get("region_name")?,
        subject_id: r.try_get("subject_id")?,
        subject_name: r.try_get("subject_name")?,
        score: r.try_get("score")?,
        deposit_bonus: r.try_get("deposit_bonus")?,
        ethic_bonus: r.try_get("ethic_bonus")?,
        ends_at: ends
            .map(|raw| parse_ts(&raw, "deposit_top.ends_at"))
            .transpose()?,
        updated_at: parse_ts(&updated, "deposit_top.updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn long_term(item: &str, subject: &str, score: f64) -> LongTermLeader {
        LongTermLeader {
            item: item.to_string(),
            subject_id: subject.to_string(),
            subject_name: format!("{subject}-name"),
            score,
            strategic: score,
            specialization: 0.0,
            ethic: 0.0,
            announced_score: score,
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_poll_state_last_write_wins() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.get_state("k").await.unwrap(), None);
        store.set_state("k", "1").await.unwrap();
        store.set_state("k", "2").await.unwrap();
        assert_eq!(store.get_state("k").await.unwrap().as_deref(), Some("2"));

        let at = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        store.set_timestamp("ts", at).await.unwrap();
        assert_eq!(store.get_timestamp("ts").await.unwrap(), Some(at));

        store.set_state("bad", "yesterday").await.unwrap();
        assert!(matches!(store.get_timestamp("bad").await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_mark_seen_is_idempotent_and_scoped() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(!store.has_seen("articles", "a1").await.unwrap());
        store.mark_seen("articles", "a1").await.unwrap();
        store.mark_seen("articles", "a1").await.unwrap();
        assert!(store.has_seen("articles", "a1").await.unwrap());
        assert_eq!(store.count_seen("articles").await.unwrap(), 1);
        // another job's scope is independent
        assert!(!store.has_seen("other", "a1").await.unwrap());

        assert_eq!(store.reset_seen("articles").await.unwrap(), 1);
        assert!(!store.has_seen("articles", "a1").await.unwrap());
    }

    #[tokio::test]
    async fn test_long_term_one_row_per_category() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_long_term(&long_term("iron", "c1", 10.0)).await.unwrap();
        store.set_long_term(&long_term("iron", "c2", 12.0)).await.unwrap();
        store.set_long_term(&long_term("grain", "c3", 5.0)).await.unwrap();

        let iron = store.get_long_term("iron").await.unwrap().unwrap();
        assert_eq!(iron.subject_id, "c2");
        assert_eq!(store.list_long_term().await.unwrap().len(), 2);

        assert!(store.delete_long_term("iron").await.unwrap());
        assert!(!store.delete_long_term("iron").await.unwrap());
        assert!(store.get_long_term("iron").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_term_window_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let rec = ShortTermLeader {
            item: "oil".to_string(),
            region_id: "r1".to_string(),
            region_name: "North".to_string(),
            subject_id: "c1".to_string(),
            subject_name: "Atlantis".to_string(),
            score: 35.0,
            deposit_bonus: 25.0,
            ethic_bonus: 10.0,
            ends_at: Some(now + Duration::hours(6)),
            updated_at: now,
        };
        store.set_short_term(&rec).await.unwrap();
        assert_eq!(store.get_short_term("oil").await.unwrap(), Some(rec.clone()));

        let open_ended = ShortTermLeader { ends_at: None, ..rec };
        store.set_short_term(&open_ended).await.unwrap();
        assert_eq!(store.list_short_term().await.unwrap(), vec![open_ended]);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("external.db");
        let path = path.to_str().unwrap();
        {
            let store = Store::open(path).await.unwrap();
            store.set_state("jobs:x:last_run", "v").await.unwrap();
            store.mark_seen("x", "s1").await.unwrap();
        }
        let store = Store::open(path).await.unwrap();
        assert_eq!(store.get_state("jobs:x:last_run").await.unwrap().as_deref(), Some("v"));
        assert!(store.has_seen("x", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("external.db");
        let result = Store::open(path.to_str().unwrap()).await;
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
