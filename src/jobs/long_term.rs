//! Long-term leader: per specialization item, the country with the highest
//! production bonus (strategic + specialization + ruling-party ethic).
//!
//! A change is announced only when the new best total beats the last
//! announced total by more than [`EPSILON`]; smaller moves are written to
//! the row but stay quiet. That includes a different country taking the
//! lead at or below the announced total: the row switches holder silently
//! and the new total becomes the baseline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Job, JobError, JobState, SweepContext, SweepReport};
use crate::client::envelope::{extract_list, integer_at, number_at, text_at, LIST_KEYS};
use crate::client::ShapeError;
use crate::sink::EventKind;
use crate::store::LongTermLeader;

pub const EPSILON: f64 = 0.01;
// Absorbs representation error so a delta of exactly EPSILON never triggers.
const EPSILON_SLACK: f64 = 1e-9;

const COUNTRIES_PROC: &str = "country.getAllCountries";
const PARTY_PROC: &str = "party.getById";

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub category: String,
    pub subject_id: String,
    pub subject_name: String,
    pub strategic: f64,
    pub specialization: f64,
    pub ethic: f64,
}

impl Candidate {
    pub fn total(&self) -> f64 {
        self.strategic + self.specialization + self.ethic
    }
}

/// Percentage points added by the ruling party's industrialism ethic.
pub fn ethic_bonus(industrialism: Option<i64>) -> f64 {
    match industrialism {
        Some(1) => 10.0,
        Some(2) => 30.0,
        _ => 0.0,
    }
}

struct CountryRow {
    candidate: Candidate,
    party_id: Option<String>,
}

fn parse_country(v: &Value) -> Result<Option<CountryRow>, ShapeError> {
    let id = text_at(v, &["_id", "id", "countryId", "code"])
        .ok_or_else(|| ShapeError::MissingField("country id".to_string()))?;
    let Some(category) = text_at(v, &["specializedItem", "specialized_item", "specialization"]) else {
        return Ok(None);
    };
    let strategic = number_at(v, &["strategicResources.bonuses.productionPercent"]);
    let specialization = number_at(v, &["rankings.countryProductionBonus.value"]);
    if strategic.is_none() && specialization.is_none() {
        return Ok(None);
    }
    Ok(Some(CountryRow {
        candidate: Candidate {
            category,
            subject_name: text_at(v, &["name"]).unwrap_or_else(|| id.clone()),
            subject_id: id,
            strategic: strategic.unwrap_or(0.0),
            specialization: specialization.unwrap_or(0.0),
            ethic: 0.0,
        },
        party_id: text_at(
            v,
            &["rulingParty.id", "rulingParty._id", "rulingParty.partyId", "rulingParty", "rulingPartyId"],
        ),
    }))
}

/// Best candidate per category. Only positive totals qualify; equal totals
/// go to the lower subject id.
pub fn pick_leaders(candidates: &[Candidate]) -> BTreeMap<String, Candidate> {
    let mut best: BTreeMap<String, Candidate> = BTreeMap::new();
    for c in candidates.iter().filter(|c| c.total() > 0.0) {
        let replace = match best.get(&c.category) {
            None => true,
            Some(cur) => {
                c.total() > cur.total() || (c.total() == cur.total() && c.subject_id < cur.subject_id)
            }
        };
        if replace {
            best.insert(c.category.clone(), c.clone());
        }
    }
    best
}

/// New row for a category plus whether the change is announced.
pub fn reconcile(prev: Option<&LongTermLeader>, c: &Candidate, now: DateTime<Utc>) -> (LongTermLeader, bool) {
    let total = c.total();
    let (announce, baseline) = match prev {
        None => (true, total),
        Some(p) if total - p.announced_score > EPSILON + EPSILON_SLACK => (true, total),
        // a quiet takeover restarts the baseline at the new holder's total
        Some(p) if p.subject_id != c.subject_id => (false, total),
        Some(p) => (false, p.announced_score),
    };
    let row = LongTermLeader {
        item: c.category.clone(),
        subject_id: c.subject_id.clone(),
        subject_name: c.subject_name.clone(),
        score: total,
        strategic: c.strategic,
        specialization: c.specialization,
        ethic: c.ethic,
        announced_score: baseline,
        updated_at: now,
    };
    (row, announce)
}

pub struct LongTermLeaderJob {
    cooldown: Duration,
}

impl LongTermLeaderJob {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    async fn fetch_candidates(&self, ctx: &SweepContext<'_>) -> Result<Vec<Candidate>, JobError> {
        let raw = ctx.client().call(COUNTRIES_PROC, None).await?;
        let countries = extract_list(&raw, LIST_KEYS)?;

        let mut rows = Vec::new();
        for country in &countries {
            match parse_country(country) {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "country skipped"),
            }
        }

        let mut seen = HashSet::new();
        let party_ids: Vec<String> = rows
            .iter()
            .filter_map(|r| r.party_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();
        let inputs: Vec<Value> = party_ids.iter().map(|id| json!({"partyId": id})).collect();
        let parties = ctx.client().batch_get(PARTY_PROC, &inputs).await;
        let industrialism: HashMap<&str, Option<i64>> = party_ids
            .iter()
            .zip(parties.iter())
            .map(|(id, party)| {
                let level = party
                    .as_ref()
                    .and_then(|p| integer_at(p, &["ethics.industrialism", "ethics.industrial"]));
                (id.as_str(), level)
            })
            .collect();

        ctx.enter(JobState::Computing);
        Ok(rows
            .into_iter()
            .map(|r| {
                let mut c = r.candidate;
                let level = r
                    .party_id
                    .as_deref()
                    .and_then(|id| industrialism.get(id).copied().flatten());
                c.ethic = ethic_bonus(level);
                c
            })
            .collect())
    }
}

#[async_trait]
impl Job for LongTermLeaderJob {
    fn name(&self) -> &'static str {
        "long_term_leader"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<SweepReport, JobError> {
        let candidates = self.fetch_candidates(ctx).await?;
        let leaders = pick_leaders(&candidates);

        ctx.enter(JobState::Diffing);
        let store = ctx.store();
        let mut report = SweepReport {
            processed: leaders.len(),
            emitted: 0,
        };
        let mut pending = Vec::new();
        for (category, leader) in &leaders {
            let prev = store.get_long_term(category).await?;
            let (row, announce) = reconcile(prev.as_ref(), leader, ctx.now);
            pending.push((row, announce, prev));
        }
        let stale: Vec<String> = store
            .list_long_term()
            .await?
            .into_iter()
            .map(|r| r.item)
            .filter(|item| !leaders.contains_key(item))
            .collect();

        ctx.enter(JobState::Persisting);
        for (row, announce, prev) in pending {
            store.set_long_term(&row).await?;
            if !announce {
                continue;
            }
            let payload = json!({
                "category": row.item,
                "subject_id": row.subject_id,
                "subject_name": row.subject_name,
                "score": row.score,
                "strategic": row.strategic,
                "specialization": row.specialization,
                "ethic": row.ethic,
                "previous": prev.map(|p| json!({
                    "subject_id": p.subject_id,
                    "subject_name": p.subject_name,
                    "score": p.announced_score,
                })),
            });
            if ctx.emit(EventKind::LongTermLeaderChanged, payload).await.is_ok() {
                report.emitted += 1;
            }
        }
        for item in &stale {
            store.delete_long_term(item).await?;
            debug!(category = %item, "long-term leader cleared");
        }

        info!(
            categories = leaders.len(),
            candidates = candidates.len(),
            cleared = stale.len(),
            announced = report.emitted,
            "long-term leaders reconciled"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::deps_with;
    use crate::jobs::{JobRunner, TickOutcome};
    use crate::sink::MemorySink;
    use crate::store::Store;
    use httpmock::{Method::GET, MockServer};
    use std::sync::Arc;

    fn cand(category: &str, subject: &str, strategic: f64) -> Candidate {
        Candidate {
            category: category.to_string(),
            subject_id: subject.to_string(),
            subject_name: subject.to_uppercase(),
            strategic,
            specialization: 0.0,
            ethic: 0.0,
        }
    }

    #[test]
    fn test_ethic_levels() {
        assert_eq!(ethic_bonus(Some(1)), 10.0);
        assert_eq!(ethic_bonus(Some(2)), 30.0);
        assert_eq!(ethic_bonus(Some(0)), 0.0);
        assert_eq!(ethic_bonus(None), 0.0);
    }

    #[test]
    fn test_pick_leaders_positive_only_with_stable_ties() {
        let leaders = pick_leaders(&[
            cand("iron", "b", 20.0),
            cand("iron", "a", 20.0),
            cand("iron", "c", 5.0),
            cand("fish", "d", 0.0),
            cand("fish", "e", -3.0),
        ]);
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders["iron"].subject_id, "a");
    }

    #[tokio::test]
    async fn test_epsilon_sequence_against_baseline() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        let mut announced = Vec::new();
        for score in [10.00, 10.005, 10.01, 10.02] {
            let prev = store.get_long_term("iron").await.unwrap();
            let (row, announce) = reconcile(prev.as_ref(), &cand("iron", "a", score), now);
            store.set_long_term(&row).await.unwrap();
            announced.push(announce);
        }
        // first sighting, +0.005 quiet, +0.01 (boundary) quiet, +0.02 announced
        assert_eq!(announced, vec![true, false, false, true]);

        let row = store.get_long_term("iron").await.unwrap().unwrap();
        assert_eq!(row.score, 10.02);
        assert_eq!(row.announced_score, 10.02);
    }

    #[test]
    fn test_quiet_row_still_tracks_latest_score() {
        let now = Utc::now();
        let (first, _) = reconcile(None, &cand("iron", "a", 10.0), now);
        let (second, announce) = reconcile(Some(&first), &cand("iron", "a", 10.004), now);
        assert!(!announce);
        assert_eq!(second.score, 10.004);
        assert_eq!(second.announced_score, 10.0);

        let (third, announce) = reconcile(Some(&second), &cand("iron", "b", 10.005), now);
        assert!(!announce);
        assert_eq!(third.subject_id, "b");
        assert_eq!(third.announced_score, 10.005);

        // a lower takeover is silent too and lowers the baseline
        let (fourth, announce) = reconcile(Some(&third), &cand("iron", "c", 9.0), now);
        assert!(!announce);
        assert_eq!(fourth.subject_id, "c");
        assert_eq!(fourth.announced_score, 9.0);
    }

    #[tokio::test]
    async fn test_sweep_applies_party_ethic_and_clears_empty_categories() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/country.getAllCountries");
                then.status(200).json_body(json!({"result": {"data": [
                    {"_id": "nl", "name": "Netherlands", "specializedItem": "iron",
                     "strategicResources": {"bonuses": {"productionPercent": 12}},
                     "rankings": {"countryProductionBonus": {"value": 8}},
                     "rulingParty": "p1"},
                    {"_id": "be", "name": "Belgium", "specializedItem": "iron",
                     "rankings": {"countryProductionBonus": {"value": 40}}},
                    {"_id": "lu", "name": "Luxembourg", "specializedItem": "fish",
                     "strategicResources": {"bonuses": {"productionPercent": 0}}}
                ]}}));
            })
            .await;
        let party = server
            .mock_async(|when, then| {
                when.method(GET).path("/party.getById").query_param("batch", "1");
                then.status(200)
                    .json_body(json!([{"result": {"data": {"ethics": {"industrialism": 2}}}}]));
            })
            .await;
        let sink = Arc::new(MemorySink::new());
        let deps = deps_with(&server.base_url(), sink.clone()).await;
        deps.store
            .set_long_term(&LongTermLeader {
                announced_score: 5.0,
                ..reconcile(None, &cand("fish", "lu", 5.0), Utc::now()).0
            })
            .await
            .unwrap();
        let runner = JobRunner::new(Arc::new(LongTermLeaderJob::new(Duration::ZERO)), deps.clone());

        let outcome = runner.run_tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed(SweepReport {
                processed: 1,
                emitted: 1
            })
        );
        assert_eq!(party.hits_async().await, 1);

        let iron = deps.store.get_long_term("iron").await.unwrap().unwrap();
        assert_eq!(iron.subject_id, "nl");
        assert_eq!(iron.score, 50.0);
        assert_eq!(iron.ethic, 30.0);
        // no positive candidate left for fish
        assert!(deps.store.get_long_term("fish").await.unwrap().is_none());

        let events = sink.events();
        assert_eq!(events[0].kind, EventKind::LongTermLeaderChanged);
        assert_eq!(events[0].payload["subject_id"], "nl");
        assert!(events[0].payload["previous"].is_null());

        // an unchanged snapshot stays quiet
        runner.run_tick().await;
        assert_eq!(sink.events().len(), 1);
    }
}
