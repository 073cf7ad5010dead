//! Short-term leader: per deposit type, the region whose running deposit
//! gives the highest bonus right now.
//!
//! Ranking is total bonus, then the window that ends latest, then the lower
//! owner id and region id. Any change of score or holder is announced.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Job, JobError, JobState, SweepContext, SweepReport};
use crate::client::envelope::{extract_id, extract_list, extract_list_or_map, lookup, number_at, text_at, LIST_KEYS};
use crate::client::ShapeError;
use crate::sink::EventKind;
use crate::store::ShortTermLeader;

const REGIONS_PROC: &str = "region.getRegions";
const COUNTRIES_PROC: &str = "country.getAllCountries";

#[derive(Debug, Clone, PartialEq)]
pub struct DepositCandidate {
    pub category: String,
    pub region_id: String,
    pub region_name: String,
    pub subject_id: String,
    pub deposit_bonus: f64,
    pub ethic_bonus: f64,
    pub ends_at: Option<DateTime<Utc>>,
}

impl DepositCandidate {
    pub fn total(&self) -> f64 {
        self.deposit_bonus + self.ethic_bonus
    }
}

/// RFC3339 string or epoch milliseconds.
fn parse_instant(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn parse_region(v: &Value) -> Result<Option<DepositCandidate>, ShapeError> {
    let Some(deposit) = v.get("deposit").filter(|d| d.is_object()) else {
        return Ok(None);
    };
    let region_id = extract_id(v).ok_or_else(|| ShapeError::MissingField("region id".to_string()))?;
    let category = text_at(deposit, &["type", "itemCode", "item"])
        .ok_or_else(|| ShapeError::MissingField(format!("deposit type of region {region_id}")))?;
    let subject_id = text_at(v, &["countryId", "country", "country._id", "country.id", "owner"])
        .ok_or_else(|| ShapeError::MissingField(format!("owner of region {region_id}")))?;
    Ok(Some(DepositCandidate {
        category,
        region_name: text_at(v, &["name"]).unwrap_or_else(|| region_id.clone()),
        region_id,
        subject_id,
        deposit_bonus: number_at(deposit, &["bonusPercent"]).unwrap_or(0.0),
        ethic_bonus: number_at(deposit, &["ethicBonusPercent"]).unwrap_or(0.0),
        ends_at: lookup(deposit, "endsAt").and_then(parse_instant),
    }))
}

/// Ordering where the better candidate sorts first.
fn rank(a: &DepositCandidate, b: &DepositCandidate) -> Ordering {
    b.total()
        .partial_cmp(&a.total())
        .unwrap_or(Ordering::Equal)
        // a window that ends later beats one that ends sooner; no end beats both
        .then_with(|| match (a.ends_at, b.ends_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => y.cmp(&x),
        })
        .then_with(|| a.subject_id.cmp(&b.subject_id))
        .then_with(|| a.region_id.cmp(&b.region_id))
}

/// Best running deposit per category. Expired windows and non-positive
/// bonuses are not candidates.
pub fn pick_leaders(candidates: &[DepositCandidate], now: DateTime<Utc>) -> BTreeMap<String, DepositCandidate> {
    let mut best: BTreeMap<String, DepositCandidate> = BTreeMap::new();
    let live = candidates
        .iter()
        .filter(|c| c.total() > 0.0)
        .filter(|c| c.ends_at.map_or(true, |end| end > now));
    for c in live {
        let replace = best
            .get(&c.category)
            .map_or(true, |cur| rank(c, cur) == Ordering::Less);
        if replace {
            best.insert(c.category.clone(), c.clone());
        }
    }
    best
}

/// Score-only changes on the same holder count.
pub fn has_changed(prev: Option<&ShortTermLeader>, c: &DepositCandidate) -> bool {
    match prev {
        None => true,
        Some(p) => p.score != c.total() || p.subject_id != c.subject_id || p.region_id != c.region_id,
    }
}

pub struct ShortTermLeaderJob {
    cooldown: Duration,
}

impl ShortTermLeaderJob {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }
}

#[async_trait]
impl Job for ShortTermLeaderJob {
    fn name(&self) -> &'static str {
        "short_term_leader"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<SweepReport, JobError> {
        let raw = ctx.client().call(REGIONS_PROC, None).await?;
        let regions = extract_list_or_map(&raw, LIST_KEYS)?;

        // Owner names are cosmetic; a failed lookup falls back to ids.
        let names: HashMap<String, String> = match ctx.client().call(COUNTRIES_PROC, None).await {
            Ok(v) => extract_list(&v, LIST_KEYS)
                .unwrap_or_default()
                .iter()
                .filter_map(|c| Some((extract_id(c)?, text_at(c, &["name"])?)))
                .collect(),
            Err(e) => {
                warn!(error = %e, "country names unavailable");
                HashMap::new()
            }
        };

        ctx.enter(JobState::Computing);
        let mut candidates = Vec::new();
        for region in &regions {
            match parse_region(region) {
                Ok(Some(c)) => candidates.push(c),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "region skipped"),
            }
        }
        let leaders = pick_leaders(&candidates, ctx.now);

        ctx.enter(JobState::Diffing);
        let store = ctx.store();
        let mut pending = Vec::new();
        for (category, c) in &leaders {
            let prev = store.get_short_term(category).await?;
            let changed = has_changed(prev.as_ref(), c);
            let row = ShortTermLeader {
                item: category.clone(),
                region_id: c.region_id.clone(),
                region_name: c.region_name.clone(),
                subject_id: c.subject_id.clone(),
                subject_name: names.get(&c.subject_id).cloned().unwrap_or_else(|| c.subject_id.clone()),
                score: c.total(),
                deposit_bonus: c.deposit_bonus,
                ethic_bonus: c.ethic_bonus,
                ends_at: c.ends_at,
                updated_at: ctx.now,
            };
            pending.push((row, changed, prev));
        }
        let stale: Vec<String> = store
            .list_short_term()
            .await?
            .into_iter()
            .map(|r| r.item)
            .filter(|item| !leaders.contains_key(item))
            .collect();

        ctx.enter(JobState::Persisting);
        let mut report = SweepReport {
            processed: leaders.len(),
            emitted: 0,
        };
        for (row, changed, prev) in pending {
            store.set_short_term(&row).await?;
            if !changed {
                continue;
            }
            let payload = json!({
                "category": row.item,
                "region_id": row.region_id,
                "region_name": row.region_name,
                "subject_id": row.subject_id,
                "subject_name": row.subject_name,
                "score": row.score,
                "deposit_bonus": row.deposit_bonus,
                "ethic_bonus": row.ethic_bonus,
                "ends_at": row.ends_at.map(|t| t.to_rfc3339()),
                "previous": prev.map(|p| json!({
                    "region_id": p.region_id,
                    "subject_id": p.subject_id,
                    "subject_name": p.subject_name,
                    "score": p.score,
                })),
            });
            if ctx.emit(EventKind::ShortTermLeaderChanged, payload).await.is_ok() {
                report.emitted += 1;
            }
        }
        for item in &stale {
            store.delete_short_term(item).await?;
            debug!(category = %item, "short-term leader cleared");
        }

        info!(
            regions = regions.len(),
            categories = leaders.len(),
            cleared = stale.len(),
            announced = report.emitted,
            "short-term leaders reconciled"
        );
        Ok(report)
    }
}
