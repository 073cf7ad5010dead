//! New-article discovery over the most recent page of the article feed.
//!
//! The first sweep ever only marks what it sees. Later sweeps announce each
//! unseen article once, oldest first, and mark it seen whether or not the
//! announcement got through.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Job, JobError, JobState, SweepContext, SweepReport};
use crate::client::envelope::{extract_id, extract_list, extract_name, text_at, LIST_KEYS};
use crate::sink::EventKind;

const FEED_PROC: &str = "article.getArticlesPaginated";
const USER_PROC: &str = "user.getUserLite";
const SEEN_SCOPE: &str = "articles";

pub struct ListingJob {
    page_size: u32,
    author_group: Option<String>,
    cooldown: Duration,
}

impl ListingJob {
    pub fn new(page_size: u32, author_group: Option<String>, cooldown: Duration) -> Self {
        Self {
            page_size,
            author_group: author_group.filter(|g| !g.is_empty()),
            cooldown,
        }
    }

    /// `Some(false)` only when the author is known to be outside the group.
    async fn author_in_group(
        &self,
        ctx: &SweepContext<'_>,
        group: &str,
        author_id: &str,
        cache: &mut HashMap<String, Option<Value>>,
    ) -> Option<bool> {
        if !cache.contains_key(author_id) {
            let user = match ctx.client().call(USER_PROC, Some(&json!({"userId": author_id}))).await {
                Ok(u) => Some(u),
                Err(e) => {
                    warn!(author = author_id, error = %e, "author lookup failed");
                    None
                }
            };
            cache.insert(author_id.to_string(), user);
        }
        let user = cache.get(author_id)?.as_ref()?;
        let country = text_at(user, &["country", "countryId", "country._id", "country.id"])?;
        Some(country == group)
    }
}

fn author_of(article: &Value) -> Option<String> {
    text_at(article, &["author", "authorId", "author._id", "author.id"])
}

#[async_trait]
impl Job for ListingJob {
    fn name(&self) -> &'static str {
        "listing"
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<SweepReport, JobError> {
        let input = json!({"type": "last", "limit": self.page_size});
        let raw = ctx.client().call(FEED_PROC, Some(&input)).await?;
        let mut items = extract_list(&raw, LIST_KEYS)?;
        // the feed is newest first
        items.reverse();

        let articles: Vec<(String, Value)> = items
            .into_iter()
            .filter_map(|a| match extract_id(&a) {
                Some(id) => Some((id, a)),
                None => {
                    warn!("article without id skipped");
                    None
                }
            })
            .collect();

        let store = ctx.store();
        let mut report = SweepReport {
            processed: articles.len(),
            emitted: 0,
        };

        if ctx.is_first_run() {
            ctx.enter(JobState::Persisting);
            for (id, _) in &articles {
                store.mark_seen(SEEN_SCOPE, id).await?;
            }
            info!(marked = articles.len(), "first run, existing articles marked seen");
            return Ok(report);
        }

        ctx.enter(JobState::Diffing);
        let mut authors: HashMap<String, Option<Value>> = HashMap::new();
        let mut skipped = 0usize;
        for (id, article) in &articles {
            if store.has_seen(SEEN_SCOPE, id).await? {
                continue;
            }
            let author_id = author_of(article);

            if let (Some(group), Some(author)) = (&self.author_group, &author_id) {
                if self.author_in_group(ctx, group, author, &mut authors).await == Some(false) {
                    debug!(article = %id, author = %author, "author outside group, skipped");
                    store.mark_seen(SEEN_SCOPE, id).await?;
                    skipped += 1;
                    continue;
                }
            }

            let author_name = author_id
                .as_ref()
                .and_then(|a| authors.get(a).cloned().flatten())
                .as_ref()
                .and_then(extract_name)
                .or_else(|| article.get("author").and_then(extract_name));
            let payload = json!({
                "id": id,
                "title": text_at(article, &["title"]),
                "author_id": author_id,
                "author_name": author_name,
                "created_at": text_at(article, &["createdAt", "publishedAt"]),
            });
            if ctx.emit(EventKind::NewListingItem, payload).await.is_ok() {
                report.emitted += 1;
            }
            store.mark_seen(SEEN_SCOPE, id).await?;
        }

        info!(
            fetched = articles.len(),
            announced = report.emitted,
            skipped = skipped,
            "article feed reconciled"
        );
        Ok(report)
    }
}
