//! Batch fetcher: cursor pagination to build a full id set, then detail
//! lookups for every id through [`ApiClient::batch_get`].

use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::envelope::{extract_cursor, extract_id, extract_list, LIST_KEYS};
use crate::client::{ApiClient, ClientError};

const GROUP_MEMBERS_PROC: &str = "user.getUsersByCountry";
const GROUP_PAGE_LIMIT: u32 = 100;

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl Page<Value> {
    /// Read a listing response. A payload without any recognisable list is
    /// treated as an empty (terminal) page.
    pub fn from_response(value: &Value) -> Self {
        match extract_list(value, LIST_KEYS) {
            Ok(items) => Page {
                items,
                next_cursor: if value.is_object() { extract_cursor(value) } else { None },
            },
            Err(e) => {
                warn!(error = %e, "listing response has no item list");
                Page {
                    items: Vec::new(),
                    next_cursor: None,
                }
            }
        }
    }
}

/// Follow cursors until one is absent or a page comes back empty.
///
/// `fetch` receives the cursor of the previous page (`None` first). A
/// cursor seen twice ends the walk as well.
pub async fn paginate<T, E, F, Fut>(delay: Duration, mut fetch: F) -> Result<Vec<T>, E>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    let mut visited: HashSet<String> = HashSet::new();
    let mut pages = 0usize;

    loop {
        let page = fetch(cursor.take()).await?;
        pages += 1;
        let empty = page.items.is_empty();
        out.extend(page.items);

        let next = match page.next_cursor {
            Some(c) if !empty => c,
            _ => break,
        };
        if !visited.insert(next.clone()) {
            warn!(cursor = %next, pages = pages, "cursor repeated, stopping pagination");
            break;
        }
        cursor = Some(next);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    debug!(pages = pages, items = out.len(), "pagination complete");
    Ok(out)
}

/// Every member id of a group (country), in listing order, de-duplicated.
pub async fn collect_group_ids(
    client: &ApiClient,
    group_id: &str,
    page_delay: Duration,
) -> Result<Vec<String>, ClientError> {
    let users = paginate(page_delay, move |cursor| async move {
        let mut input = serde_json::Map::new();
        input.insert("countryId".to_string(), json!(group_id));
        if let Some(c) = cursor {
            input.insert("cursor".to_string(), Value::String(c));
        }
        input.insert("limit".to_string(), json!(GROUP_PAGE_LIMIT));
        let input = Value::Object(input);
        let resp = client.call(GROUP_MEMBERS_PROC, Some(&input)).await?;
        Ok::<_, ClientError>(Page::from_response(&resp))
    })
    .await?;

    let mut seen = HashSet::new();
    let ids: Vec<String> = users
        .iter()
        .filter_map(extract_id)
        .filter(|id| seen.insert(id.clone()))
        .collect();
    debug!(group = group_id, members = ids.len(), "group members collected");
    Ok(ids)
}

/// Detail lookup for every id, merged back by position.
///
/// `input_key` names the procedure's id parameter (e.g. `userId`). Items
/// that failed come back as `None`.
pub async fn fetch_details(
    client: &ApiClient,
    procedure: &str,
    input_key: &str,
    ids: &[String],
) -> Vec<(String, Option<Value>)> {
    let inputs: Vec<Value> = ids.iter().map(|id| json!({ input_key: id })).collect();
    let results = client.batch_get(procedure, &inputs).await;
    ids.iter().cloned().zip(results).collect()
}
