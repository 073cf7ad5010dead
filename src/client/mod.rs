//! Resilient HTTP client for the game's tRPC API.
//!
//! Every remote call in the process goes through one [`ApiClient`]:
//! - a process-wide semaphore bounds in-flight requests
//! - retries with exponential backoff (5 attempts, 1s doubling to 30s)
//! - 429 honours `Retry-After` and rotates to the next API key
//! - 401/403 rotates the key and retries after a short fixed delay
//! - 5xx backs off without rotating
//! - [`ApiClient::batch_get`] folds many inputs of one procedure into a single
//!   `?batch=1` request and silently falls back to single calls
//!
//! The key cursor is shared by all callers: a rate limit hit by one job moves
//! every later request onto the next key.

pub mod envelope;
pub mod error;

pub use error::{ClientError, Result, ShapeError};

use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const HEADER_API_KEY: &str = "x-api-key";

/// Retry schedule for a single logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Pause before retrying with a rotated key after 401/403.
    pub auth_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            auth_retry_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub chunk_sleep: Duration,
    pub fallback_delay: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            batch_size: 30,
            chunk_sleep: Duration::from_secs(1),
            fallback_delay: Duration::from_millis(300),
        }
    }
}

impl ClientSettings {
    pub fn from_config(api: &crate::config::ApiConfig) -> Self {
        Self {
            concurrency: api.concurrency.max(1),
            timeout: Duration::from_secs(api.timeout_secs),
            retry: api.retry_policy(),
            batch_size: api.batch_size.max(1),
            chunk_sleep: Duration::from_millis(api.chunk_sleep_ms),
            fallback_delay: Duration::from_millis(api.fallback_delay_ms),
        }
    }
}

/// One physical exchange, read fully while the permit is held.
struct Reply {
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_keys: Vec<String>,
    key_index: AtomicUsize,
    permits: Semaphore,
    settings: ClientSettings,
}

impl ApiClient {
    pub fn new(base_url: &str, api_keys: Vec<String>, settings: ClientSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        info!(
            base_url = base_url,
            keys = api_keys.len(),
            concurrency = settings.concurrency,
            "API client ready"
        );
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_keys,
            key_index: AtomicUsize::new(0),
            permits: Semaphore::new(settings.concurrency.max(1)),
            settings,
        })
    }

    pub fn from_config(api: &crate::config::ApiConfig) -> Result<Self> {
        Self::new(&api.base_url, api.api_keys.clone(), ClientSettings::from_config(api))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Index of the key currently sent with requests.
    pub fn key_index(&self) -> usize {
        self.key_index.load(Ordering::SeqCst)
    }

    fn current_key(&self) -> Option<&str> {
        if self.api_keys.is_empty() {
            return None;
        }
        let idx = self.key_index.load(Ordering::SeqCst) % self.api_keys.len();
        Some(self.api_keys[idx].as_str())
    }

    fn rotate_key(&self) {
        if self.api_keys.is_empty() {
            return;
        }
        let len = self.api_keys.len();
        let prev = self
            .key_index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % len))
            .unwrap_or(0);
        info!(from = prev, to = (prev + 1) % len, "rotated API key");
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Reply> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClientError::Transport("request limiter closed".to_string()))?;

        let mut req = self.http.request(method.clone(), url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(key) = self.current_key() {
            req = req.header(HEADER_API_KEY, key);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);
        let body = resp.text().await?;
        Ok(Reply {
            status,
            retry_after,
            body,
        })
    }

    /// Issue one logical request, retrying per the policy.
    ///
    /// 2xx bodies are parsed as JSON, falling back to a JSON string holding
    /// the raw text.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let policy = &self.settings.retry;
        let mut backoff = policy.initial_backoff;
        let mut auth_rotations = 0usize;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let last = attempt >= policy.max_attempts;

            let reply = match self.send_once(&method, &url, query, body).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url, attempt = attempt, error = %e, "request failed");
                    if last {
                        return Err(e);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = policy.next_backoff(backoff);
                    continue;
                }
            };

            if reply.status.is_success() {
                debug!(url = %url, status = reply.status.as_u16(), attempt = attempt, "request ok");
                return Ok(serde_json::from_str(&reply.body)
                    .unwrap_or(Value::String(reply.body)));
            }

            let status = reply.status.as_u16();
            let remote = || ClientError::Remote {
                status,
                body: reply.body.clone(),
            };

            match status {
                429 => {
                    warn!(
                        url = %url,
                        retry_after = ?reply.retry_after,
                        attempt = attempt,
                        max = policy.max_attempts,
                        "rate limited"
                    );
                    self.rotate_key();
                    if last {
                        return Err(remote());
                    }
                    tokio::time::sleep(reply.retry_after.unwrap_or(backoff)).await;
                    backoff = policy.next_backoff(backoff);
                }
                401 | 403 => {
                    // Each configured key gets one chance per logical call.
                    if last || auth_rotations + 1 >= self.api_keys.len() {
                        warn!(url = %url, status = status, "auth rejected, no key left to try");
                        return Err(remote());
                    }
                    warn!(url = %url, status = status, "auth rejected, rotating key");
                    self.rotate_key();
                    auth_rotations += 1;
                    tokio::time::sleep(policy.auth_retry_delay).await;
                }
                500..=599 => {
                    warn!(url = %url, status = status, attempt = attempt, backoff = ?backoff, "server error");
                    if last {
                        return Err(remote());
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = policy.next_backoff(backoff);
                }
                _ => return Err(remote()),
            }
        }
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::GET, path, query, None).await
    }

    /// Call one tRPC procedure with an optional input and unwrap the envelope.
    pub async fn call(&self, procedure: &str, input: Option<&Value>) -> Result<Value> {
        let path = format!("/{}", procedure.trim_start_matches('/'));
        let query: Vec<(&str, String)> = match input {
            Some(v) => vec![("input", v.to_string())],
            None => Vec::new(),
        };
        let raw = self.get(&path, &query).await?;
        envelope::unwrap_envelope(&raw).ok_or_else(|| ClientError::Procedure(raw.to_string()))
    }

    /// Call one procedure for many inputs.
    ///
    /// Returns one entry per input, in input order: `Some(data)` on success,
    /// `None` when that input failed. The result is the same whether the
    /// server batched the chunk or the client fell back to single calls.
    pub async fn batch_get(&self, procedure: &str, inputs: &[Value]) -> Vec<Option<Value>> {
        let proc = procedure.trim_start_matches('/');
        let chunk_size = self.settings.batch_size.max(1);
        let mut results = Vec::with_capacity(inputs.len());

        for (n, chunk) in inputs.chunks(chunk_size).enumerate() {
            if n > 0 && !self.settings.chunk_sleep.is_zero() {
                tokio::time::sleep(self.settings.chunk_sleep).await;
            }
            let chunk_results = match self.try_batch(proc, n, chunk).await {
                Some(r) => r,
                None => self.fallback_singles(proc, chunk).await,
            };
            results.extend(chunk_results);
        }

        debug!(
            procedure = proc,
            inputs = inputs.len(),
            ok = results.iter().filter(|r| r.is_some()).count(),
            "batch complete"
        );
        results
    }

    async fn try_batch(&self, proc: &str, n: usize, chunk: &[Value]) -> Option<Vec<Option<Value>>> {
        let path = format!("/{}", vec![proc; chunk.len()].join(","));
        let input_map: serde_json::Map<String, Value> = chunk
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect();
        let query = [
            ("batch", "1".to_string()),
            ("input", Value::Object(input_map).to_string()),
        ];

        match self.get(&path, &query).await {
            Ok(Value::Array(items)) if items.len() == chunk.len() => {
                Some(items.iter().map(envelope::unwrap_envelope).collect())
            }
            Ok(other) => {
                warn!(
                    procedure = proc,
                    chunk = n,
                    expected = chunk.len(),
                    got = %shape_of(&other),
                    "unexpected batch response shape, falling back"
                );
                None
            }
            Err(e) => {
                warn!(procedure = proc, chunk = n, size = chunk.len(), error = %e, "batch request failed, falling back");
                None
            }
        }
    }

    async fn fallback_singles(&self, proc: &str, chunk: &[Value]) -> Vec<Option<Value>> {
        let mut out = Vec::with_capacity(chunk.len());
        for input in chunk {
            match self.call(proc, Some(input)).await {
                Ok(v) => out.push(Some(v)),
                Err(e) => {
                    debug!(procedure = proc, input = %input, error = %e, "single call failed");
                    out.push(None);
                }
            }
            if !self.settings.fallback_delay.is_zero() {
                tokio::time::sleep(self.settings.fallback_delay).await;
            }
        }
        out
    }
}

fn shape_of(v: &Value) -> String {
    match v {
        Value::Array(a) => format!("array[{}]", a.len()),
        Value::Object(_) => "object".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
    }
}
