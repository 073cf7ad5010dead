use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use super::{parse_ts, Result, Store, StoreError};

/// Where a citizen spent their skill points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillMode {
    Eco,
    War,
}

impl SkillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillMode::Eco => "eco",
            SkillMode::War => "war",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "eco" => Ok(SkillMode::Eco),
            "war" => Ok(SkillMode::War),
            other => Err(StoreError::Corrupt(format!("citizen_levels.skill_mode: {other:?}"))),
        }
    }
}

impl std::fmt::Display for SkillMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CitizenRecord {
    pub user_id: String,
    pub group_id: String,
    pub level: i64,
    pub citizen_name: Option<String>,
    pub skill_mode: Option<SkillMode>,
    pub updated_at: DateTime<Utc>,
}

/// Replaces one group's citizen rows.
///
/// The group's old rows are deleted in the same transaction as the first
/// flush, so a reader never sees an empty group while the first batch is
/// still being fetched. Rows are staged in memory and committed every
/// `flush_every` rows and on [`CitizenWriter::finish`].
pub struct CitizenWriter<'a> {
    store: &'a Store,
    group_id: String,
    flush_every: usize,
    staged: Vec<CitizenRecord>,
    cleared: bool,
    written: usize,
}

impl<'a> CitizenWriter<'a> {
    pub async fn push(&mut self, rec: CitizenRecord) -> Result<()> {
        self.staged.push(rec);
        if self.staged.len() >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.cleared && self.staged.is_empty() {
            return Ok(());
        }
        let mut tx = self.store.pool().begin().await?;
        if !self.cleared {
            sqlx::query("DELETE FROM citizen_levels WHERE group_id = ?")
                .bind(&self.group_id)
                .execute(&mut *tx)
                .await?;
        }
        for rec in &self.staged {
            sqlx::query(
                "INSERT INTO citizen_levels (user_id, group_id, level, citizen_name, skill_mode, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    group_id = excluded.group_id,
                    level = excluded.level,
                    citizen_name = excluded.citizen_name,
                    skill_mode = excluded.skill_mode,
                    updated_at = excluded.updated_at",
            )
            .bind(&rec.user_id)
            .bind(&rec.group_id)
            .bind(rec.level)
            .bind(&rec.citizen_name)
            .bind(rec.skill_mode.map(|m| m.as_str()))
            .bind(rec.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.cleared = true;
        self.written += self.staged.len();
        debug!(group = %self.group_id, flushed = self.staged.len(), total = self.written, "citizen rows flushed");
        self.staged.clear();
        Ok(())
    }

    /// Commit whatever is staged and return the total rows written.
    pub async fn finish(mut self) -> Result<usize> {
        self.flush().await?;
        Ok(self.written)
    }
}

impl Store {
    pub fn citizen_writer(&self, group_id: &str, flush_every: usize) -> CitizenWriter<'_> {
        CitizenWriter {
            store: self,
            group_id: group_id.to_string(),
            flush_every: flush_every.max(1),
            staged: Vec::new(),
            cleared: false,
            written: 0,
        }
    }

    pub async fn get_citizen(&self, user_id: &str) -> Result<Option<CitizenRecord>> {
        let row = sqlx::query("SELECT * FROM citizen_levels WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| citizen_from_row(&r)).transpose()
    }

    /// Citizens of a group, highest level first.
    pub async fn list_citizens(&self, group_id: &str) -> Result<Vec<CitizenRecord>> {
        let rows = sqlx::query("SELECT * FROM citizen_levels WHERE group_id = ? ORDER BY level DESC, user_id")
            .bind(group_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(citizen_from_row).collect()
    }
}

fn citizen_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<CitizenRecord> {
    let updated: String = r.try_get("updated_at")?;
    let mode: Option<String> = r.try_get("skill_mode")?;
    Ok(CitizenRecord {
        user_id: r.try_get("user_id")?,
        group_id: r.try_get("group_id")?,
        level: r.try_get("level")?,
        citizen_name: r.try_get("citizen_name")?,
        skill_mode: mode.as_deref().map(SkillMode::parse).transpose()?,
        updated_at: parse_ts(&updated, "citizen_levels.updated_at")?,
    })
}
