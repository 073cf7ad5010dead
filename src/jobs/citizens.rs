//! Citizen level cache: every member of a group, their level, name and
//! skill mode, replacing the group's rows on each refresh.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Job, JobError, JobState, SweepContext, SweepReport};
use crate::client::envelope::{extract_name, integer_at};
use crate::fetcher::{collect_group_ids, fetch_details};
use crate::sink::EventKind;
use crate::store::{CitizenRecord, SkillMode};

const DETAIL_PROC: &str = "user.getUserLite";
const LEVEL_PATHS: &[&str] = &["leveling.level", "level", "rankings.userLevel.value"];

const ECO_SKILLS: &[&str] = &["entrepreneurship", "energy", "production", "companies", "management"];
const WAR_SKILLS: &[&str] = &[
    "attack",
    "health",
    "hunger",
    "criticalChance",
    "criticalDamages",
    "armor",
    "precision",
    "dodge",
    "lootChance",
];

/// Classify by skill points spent per family; level L costs L(L+1)/2.
/// Ties go to eco. `None` without skill data.
pub fn skill_mode(user: &Value) -> Option<SkillMode> {
    let skills = user.get("skills")?.as_object()?;
    let (mut eco, mut war) = (0i64, 0i64);
    for (name, data) in skills {
        let level = integer_at(data, &["level"]).unwrap_or(0).max(0);
        let points = level.saturating_mul(level.saturating_add(1)) / 2;
        if ECO_SKILLS.contains(&name.as_str()) {
            eco = eco.saturating_add(points);
        } else if WAR_SKILLS.contains(&name.as_str()) {
            war = war.saturating_add(points);
        }
    }
    Some(if eco >= war { SkillMode::Eco } else { SkillMode::War })
}

pub struct CitizenRefreshJob {
    group_id: String,
    cooldown: Duration,
    page_delay: Duration,
    flush_every: usize,
}

impl CitizenRefreshJob {
    pub fn new(group_id: &str, cooldown: Duration, page_delay: Duration, flush_every: usize) -> Self {
        Self {
            group_id: group_id.to_string(),
            cooldown,
            page_delay,
            flush_every,
        }
    }
}

#[async_trait]
impl Job for CitizenRefreshJob {
    fn name(&self) -> &'static str {
        "citizen_refresh"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<SweepReport, JobError> {
        let group = self.group_id.as_str();
        let ids = collect_group_ids(ctx.client(), group, self.page_delay).await?;
        if ids.is_empty() {
            // An empty listing is more likely an upstream hiccup than a
            // group without members; keep the cache as it is.
            warn!(group = group, "no members listed, cache left untouched");
            return Ok(SweepReport::default());
        }
        let details = fetch_details(ctx.client(), DETAIL_PROC, "userId", &ids).await;
        if details.iter().all(|(_, d)| d.is_none()) {
            // Replacing the group with nothing would wipe a good cache.
            return Err(JobError::Unavailable(DETAIL_PROC.to_string()));
        }

        ctx.enter(JobState::Persisting);
        let mut writer = ctx.store().citizen_writer(group, self.flush_every);
        let mut missing = 0usize;
        for (user_id, detail) in details {
            let Some(user) = detail else {
                missing += 1;
                continue;
            };
            let Some(level) = integer_at(&user, LEVEL_PATHS) else {
                debug!(user = %user_id, "no level in user payload");
                missing += 1;
                continue;
            };
            writer
                .push(CitizenRecord {
                    user_id,
                    group_id: group.to_string(),
                    level,
                    citizen_name: extract_name(&user),
                    skill_mode: skill_mode(&user),
                    updated_at: ctx.now,
                })
                .await?;
        }
        let recorded = writer.finish().await?;

        info!(group = group, members = ids.len(), recorded = recorded, missing = missing, "citizen cache refreshed");
        let payload = json!({"group_id": group, "members": ids.len(), "recorded": recorded});
        let emitted = usize::from(ctx.emit(EventKind::CitizenCacheRefreshed, payload).await.is_ok());
        Ok(SweepReport {
            processed: ids.len(),
            emitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::deps_with;
    use crate::jobs::{JobRunner, TickOutcome};
    use crate::sink::MemorySink;
    use httpmock::{Method::GET, MockServer};
    use std::sync::Arc;

    #[test]
    fn test_skill_mode_points() {
        // eco: 3 → 6 points; war: 2 + 2 → 3 + 3 = 6 points; tie goes to eco
        let tie = json!({"skills": {"production": {"level": 3}, "attack": {"level": 2}, "armor": {"level": 2}}});
        assert_eq!(skill_mode(&tie), Some(SkillMode::Eco));
        let war = json!({"skills": {"energy": {"level": 1}, "precision": {"level": 4}}});
        assert_eq!(skill_mode(&war), Some(SkillMode::War));
        assert_eq!(skill_mode(&json!({"level": 3})), None);
    }

    #[test]
    fn test_skill_mode_survives_absurd_levels() {
        let huge = json!({"skills": {"production": {"level": i64::MAX}, "attack": {"level": i64::MAX}}});
        assert_eq!(skill_mode(&huge), Some(SkillMode::Eco));
        let war = json!({"skills": {"energy": {"level": 1}, "armor": {"level": i64::MAX}}});
        assert_eq!(skill_mode(&war), Some(SkillMode::War));
    }

    #[tokio::test]
    async fn test_refresh_batches_details_and_replaces_group() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUsersByCountry");
                then.status(200)
                    .json_body(json!({"result": {"data": {"items": [{"_id": "u1"}, {"_id": "u2"}, {"_id": "u3"}]}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUserLite,user.getUserLite,user.getUserLite");
                then.status(200).json_body(json!([
                    {"result": {"data": {"username": "anna", "leveling": {"level": 14},
                                         "skills": {"attack": {"level": 5}}}}},
                    {"result": {"data": {"username": "bram", "rankings": {"userLevel": {"value": "9"}}}}},
                    {"result": {"data": {"username": "cees"}}}
                ]));
            })
            .await;
        let sink = Arc::new(MemorySink::new());
        let deps = deps_with(&server.base_url(), sink.clone()).await;
        let mut stale = deps.store.citizen_writer("nl", 10);
        stale
            .push(CitizenRecord {
                user_id: "left".to_string(),
                group_id: "nl".to_string(),
                level: 40,
                citizen_name: None,
                skill_mode: None,
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        stale.finish().await.unwrap();

        let job = CitizenRefreshJob::new("nl", Duration::ZERO, Duration::ZERO, 2);
        let runner = JobRunner::new(Arc::new(job), deps.clone());
        runner.run_tick().await;

        let rows = deps.store.list_citizens("nl").await.unwrap();
        let summary: Vec<(&str, i64)> = rows.iter().map(|r| (r.user_id.as_str(), r.level)).collect();
        assert_eq!(summary, vec![("u1", 14), ("u2", 9)]);
        assert_eq!(rows[0].skill_mode, Some(SkillMode::War));
        assert_eq!(rows[1].citizen_name.as_deref(), Some("bram"));

        let events = sink.events();
        assert_eq!(events[0].kind, EventKind::CitizenCacheRefreshed);
        assert_eq!(events[0].payload["recorded"], 2);
    }

    #[tokio::test]
    async fn test_detail_outage_keeps_cache() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUsersByCountry");
                then.status(200)
                    .json_body(json!({"result": {"data": {"items": [{"_id": "u1"}, {"_id": "u2"}]}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path_contains("user.getUserLite");
                then.status(503);
            })
            .await;
        let sink = Arc::new(MemorySink::new());
        let deps = deps_with(&server.base_url(), sink.clone()).await;
        let mut seed = deps.store.citizen_writer("nl", 10);
        for id in ["u1", "u2"] {
            seed.push(CitizenRecord {
                user_id: id.to_string(),
                group_id: "nl".to_string(),
                level: 20,
                citizen_name: None,
                skill_mode: None,
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        }
        seed.finish().await.unwrap();

        let job = CitizenRefreshJob::new("nl", Duration::ZERO, Duration::ZERO, 2);
        let runner = JobRunner::new(Arc::new(job), deps.clone());
        assert!(matches!(runner.run_tick().await, TickOutcome::Failed(_)));

        assert_eq!(deps.store.list_citizens("nl").await.unwrap().len(), 2);
        assert!(sink.events().is_empty());
    }
}
