use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashSet;

use super::{parse_ts, Result, Store};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub user_id: String,
    pub group_id: String,
    pub display_name: String,
    pub score: f64,
    pub sample_size: i64,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Upsert a batch of scores in one transaction (one durability point).
    pub async fn upsert_scores(&self, records: &[ScoreRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for rec in records {
            sqlx::query(
                "INSERT INTO luck_scores (user_id, group_id, display_name, score, sample_size, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                    group_id = excluded.group_id,
                    display_name = excluded.display_name,
                    score = excluded.score,
                    sample_size = excluded.sample_size,
                    updated_at = excluded.updated_at",
            )
            .bind(&rec.user_id)
            .bind(&rec.group_id)
            .bind(&rec.display_name)
            .bind(rec.score)
            .bind(rec.sample_size)
            .bind(rec.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_score(&self, record: &ScoreRecord) -> Result<()> {
        self.upsert_scores(std::slice::from_ref(record)).await
    }

    /// Delete the group's rows whose user is not in `keep`. Returns rows removed.
    pub async fn retain_scores(&self, group_id: &str, keep: &HashSet<String>) -> Result<u64> {
        let rows = sqlx::query("SELECT user_id FROM luck_scores WHERE group_id = ?")
            .bind(group_id)
            .fetch_all(self.pool())
            .await?;
        let mut stale = Vec::new();
        for r in &rows {
            let id: String = r.try_get("user_id")?;
            if !keep.contains(&id) {
                stale.push(id);
            }
        }
        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool().begin().await?;
        let mut removed = 0;
        for id in &stale {
            removed += sqlx::query("DELETE FROM luck_scores WHERE user_id = ? AND group_id = ?")
                .bind(id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn delete_scores_for_group(&self, group_id: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM luck_scores WHERE group_id = ?")
            .bind(group_id)
            .execute(self.pool())
            .await?;
        Ok(done.rows_affected())
    }

    pub async fn get_score(&self, user_id: &str) -> Result<Option<ScoreRecord>> {
        let row = sqlx::query("SELECT * FROM luck_scores WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| score_from_row(&r)).transpose()
    }

    /// Scores of a group, best first.
    pub async fn list_scores(&self, group_id: &str) -> Result<Vec<ScoreRecord>> {
        let rows = sqlx::query("SELECT * FROM luck_scores WHERE group_id = ? ORDER BY score DESC, user_id")
            .bind(group_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(score_from_row).collect()
    }
}

fn score_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<ScoreRecord> {
    let updated: String = r.try_get("updated_at")?;
    Ok(ScoreRecord {
        user_id: r.try_get("user_id")?,
        group_id: r.try_get("group_id")?,
        display_name: r.try_get("display_name")?,
        score: r.try_get("score")?,
        sample_size: r.try_get("sample_size")?,
        updated_at: parse_ts(&updated, "luck_scores.updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(user: &str, score: f64) -> ScoreRecord {
        ScoreRecord {
            user_id: user.to_string(),
            group_id: "nl".to_string(),
            display_name: user.to_uppercase(),
            score,
            sample_size: 40,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_order() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_scores(&[rec("a", 1.5), rec("b", -3.0), rec("c", 12.0)])
            .await
            .unwrap();
        store.upsert_score(&rec("b", 20.0)).await.unwrap();

        let ranked: Vec<String> = store
            .list_scores("nl")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(ranked, vec!["b", "c", "a"]);
        assert_eq!(store.get_score("b").await.unwrap().unwrap().score, 20.0);
    }

    #[tokio::test]
    async fn test_retain_drops_unranked_members() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_scores(&[rec("a", 1.0), rec("b", 2.0), rec("c", 3.0)])
            .await
            .unwrap();
        let keep: HashSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();

        assert_eq!(store.retain_scores("nl", &keep).await.unwrap(), 1);
        assert!(store.get_score("b").await.unwrap().is_none());
        assert_eq!(store.retain_scores("nl", &keep).await.unwrap(), 0);
        assert_eq!(store.delete_scores_for_group("nl").await.unwrap(), 2);
    }
}
