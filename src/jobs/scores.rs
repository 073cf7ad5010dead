//! Luck ranking of a group: case-opening history per member, scored against
//! the stated drop rates.
//!
//! The group sweep and the on-demand single-member computation share one
//! lock in [`ScoreService`]: both page through the same rate-limited
//! transaction endpoint and never run at the same time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Job, JobError, JobState, SweepContext, SweepReport};
use crate::client::envelope::{extract_list, extract_name, lookup, text_at};
use crate::client::{ApiClient, ClientError};
use crate::fetcher::{collect_group_ids, fetch_details, paginate, Page};
use crate::scoring::{score, Rarity, RarityCounts};
use crate::sink::EventKind;
use crate::store::{ScoreRecord, Store, StoreError};

const GAME_CONFIG_PROC: &str = "gameConfig.getGameConfig";
const TRANSACTIONS_PROC: &str = "transaction.getPaginatedTransactions";
const USER_PROC: &str = "user.getUserLite";
const TX_PAGE_LIMIT: u32 = 100;

pub fn ranking_total_key(group_id: &str) -> String {
    format!("scores:{group_id}:ranking_total")
}

/// Item code → rarity, from the game config.
pub type RarityTable = HashMap<String, Rarity>;

fn parse_rarities(config: &Value) -> RarityTable {
    let mut table = RarityTable::new();
    let mut add = |code: String, item: &Value| {
        if let Some(r) = text_at(item, &["rarity"]).as_deref().and_then(Rarity::parse) {
            table.insert(code, r);
        }
    };
    match lookup(config, "items") {
        Some(Value::Object(items)) => {
            for (code, item) in items {
                add(code.clone(), item);
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(code) = text_at(item, &["code", "_id", "id"]) {
                    add(code, item);
                }
            }
        }
        _ => {}
    }
    table
}

/// Rarity counts of received items. Elite (mythic) case openings are
/// ignored; unknown items count as common.
pub fn count_openings(transactions: &[Value], rarities: &RarityTable) -> RarityCounts {
    let mut counts = RarityCounts::new();
    for tx in transactions {
        let opened = text_at(tx, &["itemCode"]).unwrap_or_default();
        if rarities.get(&opened) == Some(&Rarity::Mythic) {
            continue;
        }
        let received = text_at(tx, &["item.code", "item"]).unwrap_or_default();
        let rarity = rarities.get(&received).copied().unwrap_or(Rarity::Common);
        *counts.entry(rarity).or_insert(0) += 1;
    }
    counts
}

#[derive(Debug, Clone, PartialEq)]
pub enum SingleScore {
    Ranked(ScoreRecord),
    BelowFloor { sample_size: u64 },
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rank {
    pub position: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub members: usize,
    pub ranked: usize,
    pub below_floor: usize,
    pub unavailable: usize,
    pub removed: u64,
}

pub struct ScoreService {
    client: Arc<ApiClient>,
    store: Store,
    heavy: Mutex<()>,
    min_sample: u64,
    page_delay: Duration,
    flush_every: usize,
}

impl ScoreService {
    pub fn new(client: Arc<ApiClient>, store: Store, min_sample: u64, page_delay: Duration, flush_every: usize) -> Self {
        Self {
            client,
            store,
            heavy: Mutex::new(()),
            min_sample,
            page_delay,
            flush_every: flush_every.max(1),
        }
    }

    pub async fn load_rarities(&self) -> Result<RarityTable, ClientError> {
        let config = self.client.call(GAME_CONFIG_PROC, None).await?;
        let table = parse_rarities(&config);
        debug!(items = table.len(), "item rarities loaded");
        Ok(table)
    }

    async fn transactions(&self, user_id: &str) -> Result<Vec<Value>, ClientError> {
        let client = self.client.as_ref();
        paginate(self.page_delay, move |cursor| async move {
            let mut input = Map::new();
            if let Some(c) = cursor {
                input.insert("cursor".to_string(), Value::String(c));
            }
            input.insert("limit".to_string(), json!(TX_PAGE_LIMIT));
            input.insert("transactionType".to_string(), json!("openCase"));
            input.insert("userId".to_string(), json!(user_id));
            let resp = client.call(TRANSACTIONS_PROC, Some(&Value::Object(input))).await?;
            let items = extract_list(&resp, &["items", "transactions", "results"]).unwrap_or_default();
            let next_cursor = text_at(&resp, &["nextCursor", "cursor"]);
            Ok::<_, ClientError>(Page { items, next_cursor })
        })
        .await
    }

    /// Score one member. Remote failures for this member yield `Unavailable`
    /// and never abort the caller.
    async fn score_member(
        &self,
        user_id: &str,
        group_id: &str,
        display_name: String,
        rarities: &RarityTable,
        now: DateTime<Utc>,
    ) -> SingleScore {
        let transactions = match self.transactions(user_id).await {
            Ok(t) => t,
            Err(e) if e.is_auth() => {
                info!(user = user_id, "case history needs session auth, skipped");
                return SingleScore::Unavailable;
            }
            Err(e) => {
                warn!(user = user_id, error = %e, "case history fetch failed");
                return SingleScore::Unavailable;
            }
        };
        let counts = count_openings(&transactions, rarities);
        let total: u64 = counts.values().sum();
        if total < self.min_sample {
            return SingleScore::BelowFloor { sample_size: total };
        }
        SingleScore::Ranked(ScoreRecord {
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            display_name,
            score: score(&counts, total),
            sample_size: total as i64,
            updated_at: now,
        })
    }

    /// On-demand score for one member, persisted the same way a sweep would.
    /// Waits for a running sweep to finish.
    pub async fn compute_single(&self, user_id: &str, group_id: &str) -> Result<SingleScore, JobError> {
        let _heavy = self.heavy.lock().await;
        let rarities = self.load_rarities().await?;
        let name = match self.client.call(USER_PROC, Some(&json!({"userId": user_id}))).await {
            Ok(user) => extract_name(&user),
            Err(e) => {
                debug!(user = user_id, error = %e, "name lookup failed");
                None
            }
        }
        .unwrap_or_else(|| user_id.to_string());

        let result = self
            .score_member(user_id, group_id, name, &rarities, Utc::now())
            .await;
        match &result {
            SingleScore::Ranked(rec) => self.store.upsert_score(rec).await?,
            SingleScore::BelowFloor { .. } => {
                let mut keep = HashSet::new();
                for rec in self.store.list_scores(group_id).await? {
                    if rec.user_id != user_id {
                        keep.insert(rec.user_id);
                    }
                }
                self.store.retain_scores(group_id, &keep).await?;
            }
            SingleScore::Unavailable => {}
        }
        Ok(result)
    }

    /// Full group sweep under the shared lock.
    pub async fn sweep_group(
        &self,
        group_id: &str,
        now: DateTime<Utc>,
        on_state: &(dyn Fn(JobState) + Send + Sync),
    ) -> Result<SweepSummary, JobError> {
        let _heavy = self.heavy.lock().await;
        let rarities = self.load_rarities().await?;
        let ids = collect_group_ids(&self.client, group_id, self.page_delay).await?;
        if ids.is_empty() {
            warn!(group = group_id, "group listing came back empty, ranking left as is");
            return Ok(SweepSummary::default());
        }
        let details = fetch_details(&self.client, USER_PROC, "userId", &ids).await;

        on_state(JobState::Computing);
        let mut summary = SweepSummary {
            members: ids.len(),
            ..SweepSummary::default()
        };
        let mut ranked: HashSet<String> = HashSet::new();
        // Members whose history could not be read keep their last score.
        let mut keep: HashSet<String> = HashSet::new();
        let mut pending: Vec<ScoreRecord> = Vec::new();
        for (user_id, detail) in details {
            let name = detail
                .as_ref()
                .and_then(extract_name)
                .unwrap_or_else(|| user_id.clone());
            let result = self.score_member(&user_id, group_id, name, &rarities, now).await;
            match result {
                SingleScore::Ranked(rec) => {
                    ranked.insert(rec.user_id.clone());
                    pending.push(rec);
                    if pending.len() >= self.flush_every {
                        self.store.upsert_scores(&pending).await?;
                        pending.clear();
                    }
                }
                SingleScore::BelowFloor { .. } => summary.below_floor += 1,
                SingleScore::Unavailable => {
                    summary.unavailable += 1;
                    keep.insert(user_id);
                }
            }
        }

        on_state(JobState::Persisting);
        self.store.upsert_scores(&pending).await?;
        summary.ranked = ranked.len();
        keep.extend(ranked);
        summary.removed = self.store.retain_scores(group_id, &keep).await?;
        let total = self.store.list_scores(group_id).await?.len();
        self.store
            .set_state(&ranking_total_key(group_id), &total.to_string())
            .await?;
        Ok(summary)
    }

    /// Position of a member in their group's ranking, out of the denominator
    /// stored by the last completed sweep.
    pub async fn rank_of(&self, user_id: &str) -> Result<Option<Rank>, StoreError> {
        let Some(rec) = self.store.get_score(user_id).await? else {
            return Ok(None);
        };
        let ranking = self.store.list_scores(&rec.group_id).await?;
        let Some(idx) = ranking.iter().position(|r| r.user_id == user_id) else {
            return Ok(None);
        };
        let total = match self.store.get_state(&ranking_total_key(&rec.group_id)).await? {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| StoreError::Corrupt(format!("ranking total {raw:?}")))?,
            None => ranking.len(),
        };
        Ok(Some(Rank {
            position: idx + 1,
            total: total.max(idx + 1),
        }))
    }
}

pub struct ScoreSweepJob {
    service: Arc<ScoreService>,
    group_id: String,
    cooldown: Duration,
}

impl ScoreSweepJob {
    pub fn new(service: Arc<ScoreService>, group_id: &str, cooldown: Duration) -> Self {
        Self {
            service,
            group_id: group_id.to_string(),
            cooldown,
        }
    }
}

#[async_trait]
impl Job for ScoreSweepJob {
    fn name(&self) -> &'static str {
        "score_sweep"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<SweepReport, JobError> {
        let summary = self
            .service
            .sweep_group(&self.group_id, ctx.now, &|state| ctx.enter(state))
            .await?;
        if summary.members == 0 {
            return Ok(SweepReport::default());
        }
        info!(
            group = %self.group_id,
            members = summary.members,
            ranked = summary.ranked,
            below_floor = summary.below_floor,
            unavailable = summary.unavailable,
            removed = summary.removed,
            "score sweep finished"
        );
        let payload = json!({
            "group_id": self.group_id,
            "members": summary.members,
            "ranked": summary.ranked,
            "below_floor": summary.below_floor,
            "unavailable": summary.unavailable,
        });
        let emitted = usize::from(ctx.emit(EventKind::ScoreSweepCompleted, payload).await.is_ok());
        Ok(SweepReport {
            processed: summary.members,
            emitted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::test_client;
    use crate::jobs::tests::deps_with;
    use crate::jobs::{JobRunner, TickOutcome};
    use crate::sink::MemorySink;
    use httpmock::{Method::GET, MockServer};

    fn openings(n: usize, elite: usize) -> Vec<Value> {
        let mut txs: Vec<Value> = (0..n)
            .map(|i| {
                let drop = if i == 0 { "sword" } else { "bread" };
                json!({"itemCode": "case1", "item": {"code": drop}})
            })
            .collect();
        txs.extend((0..elite).map(|_| json!({"itemCode": "case2", "item": {"code": "crown"}})));
        txs
    }

    async fn mount_world(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gameConfig.getGameConfig");
                then.status(200).json_body(json!({"result": {"data": {"items": {
                    "case1": {"rarity": "common"},
                    "case2": {"rarity": "mythic"},
                    "sword": {"rarity": "rare"},
                    "crown": {"rarity": "legendary"}
                }}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUsersByCountry");
                then.status(200)
                    .json_body(json!({"result": {"data": {"items": [{"_id": "u19"}, {"_id": "u20"}]}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUserLite,user.getUserLite");
                then.status(200).json_body(json!([
                    {"result": {"data": {"username": "nineteen"}}},
                    {"result": {"data": {"username": "twenty"}}}
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/user.getUserLite")
                    .query_param("input", r#"{"userId":"u20"}"#);
                then.status(200).json_body(json!({"result": {"data": {"username": "twenty"}}}));
            })
            .await;
        for (user, n) in [("u19", 19usize), ("u20", 20usize)] {
            let body = json!({"result": {"data": {"items": openings(n, 1), "nextCursor": null}}});
            server
                .mock_async(move |when, then| {
                    when.method(GET).path("/transaction.getPaginatedTransactions").query_param(
                        "input",
                        format!(r#"{{"limit":100,"transactionType":"openCase","userId":"{user}"}}"#),
                    );
                    then.status(200).json_body(body);
                })
                .await;
        }
    }

    #[test]
    fn test_elite_cases_skipped_and_unknown_items_common() {
        let rarities: RarityTable = [
            ("case2".to_string(), Rarity::Mythic),
            ("sword".to_string(), Rarity::Rare),
        ]
        .into_iter()
        .collect();
        let counts = count_openings(&openings(3, 2), &rarities);
        assert_eq!(counts.get(&Rarity::Rare), Some(&1));
        assert_eq!(counts.get(&Rarity::Common), Some(&2));
        assert_eq!(counts.values().sum::<u64>(), 3);
    }

    #[test]
    fn test_rarity_table_from_list() {
        let table = parse_rarities(&json!({"items": [{"code": "a", "rarity": "epic"}, {"code": "b"}]}));
        assert_eq!(table.len(), 1);
        assert_eq!(table["a"], Rarity::Epic);
    }

    #[tokio::test]
    async fn test_sample_floor_and_single_path_convergence() {
        let server = MockServer::start_async().await;
        mount_world(&server).await;
        let sink = Arc::new(MemorySink::new());
        let deps = deps_with(&server.base_url(), sink.clone()).await;
        let service = Arc::new(ScoreService::new(
            deps.client.clone(),
            deps.store.clone(),
            20,
            Duration::ZERO,
            1,
        ));
        let runner = JobRunner::new(
            Arc::new(ScoreSweepJob::new(service.clone(), "nl", Duration::ZERO)),
            deps.clone(),
        );

        let outcome = runner.run_tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Completed(SweepReport {
                processed: 2,
                emitted: 1
            })
        );
        let ranking = deps.store.list_scores("nl").await.unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking[0].user_id, "u20");
        assert_eq!(ranking[0].display_name, "twenty");
        assert_eq!(ranking[0].sample_size, 20);
        assert_eq!(
            deps.store.get_state(&ranking_total_key("nl")).await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            service.rank_of("u20").await.unwrap(),
            Some(Rank { position: 1, total: 1 })
        );
        assert_eq!(service.rank_of("u19").await.unwrap(), None);

        let swept = ranking[0].score;
        match service.compute_single("u20", "nl").await.unwrap() {
            SingleScore::Ranked(rec) => assert_eq!(rec.score, swept),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(deps.store.get_score("u20").await.unwrap().unwrap().score, swept);
    }

    #[tokio::test]
    async fn test_auth_protected_history_is_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/transaction.getPaginatedTransactions");
                then.status(401);
            })
            .await;
        let client = Arc::new(test_client(&server, &[]));
        let store = Store::open_in_memory().await.unwrap();
        let service = ScoreService::new(client, store, 20, Duration::ZERO, 10);

        let result = service
            .score_member("u1", "nl", "u1".to_string(), &RarityTable::new(), Utc::now())
            .await;
        assert_eq!(result, SingleScore::Unavailable);
    }

    fn seeded(user_id: &str, score: f64) -> ScoreRecord {
        ScoreRecord {
            user_id: user_id.to_string(),
            group_id: "nl".to_string(),
            display_name: user_id.to_string(),
            score,
            sample_size: 25,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unreadable_history_keeps_previous_score() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gameConfig.getGameConfig");
                then.status(200).json_body(json!({"result": {"data": {"items": {}}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUsersByCountry");
                then.status(200)
                    .json_body(json!({"result": {"data": {"items": [{"_id": "u1"}, {"_id": "u2"}]}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/transaction.getPaginatedTransactions");
                then.status(503);
            })
            .await;
        let client = Arc::new(test_client(&server, &[]));
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_scores(&[seeded("u1", 42.0), seeded("gone", 7.0)]).await.unwrap();
        let service = ScoreService::new(client, store.clone(), 20, Duration::ZERO, 10);

        let summary = service.sweep_group("nl", Utc::now(), &|_| {}).await.unwrap();
        assert_eq!(summary.unavailable, 2);
        assert_eq!(summary.ranked, 0);
        assert_eq!(summary.removed, 1);
        assert_eq!(store.get_score("u1").await.unwrap().map(|r| r.score), Some(42.0));
        assert_eq!(store.get_score("gone").await.unwrap(), None);
        assert_eq!(
            store.get_state(&ranking_total_key("nl")).await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_empty_member_listing_leaves_ranking_alone() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gameConfig.getGameConfig");
                then.status(200).json_body(json!({"result": {"data": {"items": {}}}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user.getUsersByCountry");
                then.status(200).json_body(json!({"result": {"data": {"items": []}}}));
            })
            .await;
        let client = Arc::new(test_client(&server, &[]));
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_score(&seeded("u1", 42.0)).await.unwrap();
        store.set_state(&ranking_total_key("nl"), "1").await.unwrap();
        let service = ScoreService::new(client, store.clone(), 20, Duration::ZERO, 10);

        let summary = service.sweep_group("nl", Utc::now(), &|_| {}).await.unwrap();
        assert_eq!(summary, SweepSummary::default());
        assert_eq!(store.list_scores("nl").await.unwrap().len(), 1);
        assert_eq!(
            store.get_state(&ranking_total_key("nl")).await.unwrap().as_deref(),
            Some("1")
        );
    }
}
