//! Periodic reconciliation jobs.
//!
//! Every job is a [`Job`] driven by a [`JobRunner`]:
//!
//!   Idle → Fetching → Computing → Diffing → Persisting → Idle
//!
//! `Skipped` is taken straight from Idle when the cooldown guard (the
//! `jobs:{name}:last_run` poll-state key) says the previous sweep is too
//! recent. `Failed` is taken from any state when the sweep returns an
//! error; it is logged and the runner goes back to Idle. A tick that finds
//! the previous tick of the same job still running is dropped.

pub mod citizens;
pub mod listing;
pub mod long_term;
pub mod scores;
pub mod short_term;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::{ApiClient, ClientError, ShapeError};
use crate::config::Config;
use crate::sink::{Event, EventKind, NotificationSink, SinkError};
use crate::store::{Store, StoreError};

pub use citizens::CitizenRefreshJob;
pub use listing::ListingJob;
pub use long_term::LongTermLeaderJob;
pub use scores::{ScoreService, ScoreSweepJob};
pub use short_term::ShortTermLeaderJob;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("nothing usable from {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Fetching,
    Computing,
    Diffing,
    Persisting,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Subjects or categories looked at.
    pub processed: usize,
    /// Events handed to the sink.
    pub emitted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed(SweepReport),
    Skipped { next_due: DateTime<Utc> },
    Overlapped,
    Failed(String),
}

/// Everything a sweep talks to.
pub struct JobDeps {
    pub client: Arc<ApiClient>,
    pub store: Store,
    pub sink: Arc<dyn NotificationSink>,
}

struct StateCell {
    job: &'static str,
    state: StdMutex<JobState>,
}

impl StateCell {
    fn set(&self, next: JobState) {
        if let Ok(mut s) = self.state.lock() {
            if *s != next {
                debug!(job = self.job, from = ?*s, to = ?next, "job state");
            }
            *s = next;
        }
    }

    fn get(&self) -> JobState {
        self.state.lock().map(|s| *s).unwrap_or(JobState::Failed)
    }
}

/// Per-sweep view handed to [`Job::sweep`].
pub struct SweepContext<'a> {
    deps: &'a JobDeps,
    state: &'a StateCell,
    /// Start of the previous successful sweep; `None` on the very first run.
    pub last_run: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl<'a> SweepContext<'a> {
    pub fn client(&self) -> &ApiClient {
        &self.deps.client
    }

    pub fn store(&self) -> &Store {
        &self.deps.store
    }

    pub fn is_first_run(&self) -> bool {
        self.last_run.is_none()
    }

    pub fn enter(&self, state: JobState) {
        self.state.set(state);
    }

    /// Hand one event to the sink. Failures are logged and returned; callers
    /// decide whether a failed delivery matters.
    pub async fn emit(&self, kind: EventKind, payload: Value) -> Result<(), SinkError> {
        let result = self.deps.sink.notify(Event::new(kind, payload)).await;
        if let Err(e) = &result {
            warn!(job = self.state.job, kind = ?kind, error = %e, "notification not delivered");
        }
        result
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum gap between two sweeps. Zero disables the guard.
    fn cooldown(&self) -> Duration {
        Duration::ZERO
    }

    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<SweepReport, JobError>;
}

pub struct JobRunner {
    job: Arc<dyn Job>,
    deps: Arc<JobDeps>,
    state: StateCell,
    running: Mutex<()>,
}

impl JobRunner {
    pub fn new(job: Arc<dyn Job>, deps: Arc<JobDeps>) -> Self {
        let name = job.name();
        Self {
            job,
            deps,
            state: StateCell {
                job: name,
                state: StdMutex::new(JobState::Idle),
            },
            running: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    pub fn state(&self) -> JobState {
        self.state.get()
    }

    pub fn cooldown_key(&self) -> String {
        cooldown_key(self.name())
    }

    /// Scheduled tick: honours the cooldown guard.
    pub async fn run_tick(&self) -> TickOutcome {
        self.run(false).await
    }

    /// Operator "poll now": bypasses the cooldown, not the overlap guard.
    pub async fn run_forced(&self) -> TickOutcome {
        self.run(true).await
    }

    async fn run(&self, force: bool) -> TickOutcome {
        let job = self.name();
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(job = job, "previous sweep still running, tick dropped");
                return TickOutcome::Overlapped;
            }
        };

        let now = Utc::now();
        let key = self.cooldown_key();
        let last_run = match self.deps.store.get_timestamp(&key).await {
            Ok(v) => v,
            Err(e) => return self.fail(JobError::from(e)),
        };

        if !force {
            if let Some(next_due) = next_due(last_run, self.job.cooldown()) {
                if now < next_due {
                    self.state.set(JobState::Skipped);
                    info!(job = job, next_due = %next_due, "cooldown active, sweep skipped");
                    self.state.set(JobState::Idle);
                    return TickOutcome::Skipped { next_due };
                }
            }
        }

        self.state.set(JobState::Fetching);
        let ctx = SweepContext {
            deps: &self.deps,
            state: &self.state,
            last_run,
            now,
        };
        let report = match self.job.sweep(&ctx).await {
            Ok(r) => r,
            Err(e) => return self.fail(e),
        };

        self.state.set(JobState::Persisting);
        if let Err(e) = self.deps.store.set_timestamp(&key, now).await {
            return self.fail(JobError::from(e));
        }
        self.state.set(JobState::Idle);
        info!(
            job = job,
            forced = force,
            processed = report.processed,
            emitted = report.emitted,
            "sweep completed"
        );
        TickOutcome::Completed(report)
    }

    fn fail(&self, err: JobError) -> TickOutcome {
        self.state.set(JobState::Failed);
        error!(job = self.name(), error = %err, "sweep failed");
        self.state.set(JobState::Idle);
        TickOutcome::Failed(err.to_string())
    }

    /// Tick every `every`. Each tick runs in its own task so a long sweep
    /// makes later ticks hit the overlap guard instead of queueing.
    pub fn spawn(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = self.name(), every_secs = every.as_secs(), "job scheduled");
            loop {
                interval.tick().await;
                let runner = self.clone();
                tokio::spawn(async move {
                    runner.run_tick().await;
                });
            }
        })
    }
}

/// One configured job and how often it ticks.
pub struct Scheduled {
    pub runner: Arc<JobRunner>,
    pub every: Duration,
    pub enabled: bool,
}

/// Every job the config can describe. Group jobs without a group id are
/// left out; disabled jobs are built but flagged so one-shot runs can still
/// reach them.
pub fn build_schedule(config: &Config, deps: Arc<JobDeps>) -> (Vec<Scheduled>, Arc<ScoreService>) {
    let jobs = &config.jobs;
    let secs = Duration::from_secs;
    let page_delay = |ms: u64| Duration::from_millis(ms);
    let flush_every = config.store.flush_every;

    let scores = Arc::new(ScoreService::new(
        deps.client.clone(),
        deps.store.clone(),
        config.scoring.min_sample,
        page_delay(jobs.scores.page_delay_ms),
        flush_every,
    ));

    let mut planned = vec![
        plan(
            LongTermLeaderJob::new(secs(jobs.long_term.cooldown_secs)),
            secs(jobs.long_term.interval_secs),
            jobs.long_term.enabled,
        ),
        plan(
            ShortTermLeaderJob::new(secs(jobs.short_term.cooldown_secs)),
            secs(jobs.short_term.interval_secs),
            jobs.short_term.enabled,
        ),
        plan(
            ListingJob::new(
                jobs.listing.page_size,
                jobs.listing.author_group.clone(),
                secs(jobs.listing.cooldown_secs),
            ),
            secs(jobs.listing.interval_secs),
            jobs.listing.enabled,
        ),
    ];
    if !jobs.citizens.group_id.is_empty() {
        planned.push(plan(
            CitizenRefreshJob::new(
                &jobs.citizens.group_id,
                secs(jobs.citizens.cooldown_secs),
                page_delay(jobs.citizens.page_delay_ms),
                flush_every,
            ),
            secs(jobs.citizens.interval_secs),
            jobs.citizens.enabled,
        ));
    }
    if !jobs.scores.group_id.is_empty() {
        planned.push(plan(
            ScoreSweepJob::new(scores.clone(), &jobs.scores.group_id, secs(jobs.scores.cooldown_secs)),
            secs(jobs.scores.interval_secs),
            jobs.scores.enabled,
        ));
    }

    let schedule = planned
        .into_iter()
        .map(|(job, every, enabled)| Scheduled {
            runner: Arc::new(JobRunner::new(job, deps.clone())),
            every: every.max(Duration::from_secs(1)),
            enabled,
        })
        .collect();
    (schedule, scores)
}

fn plan(job: impl Job + 'static, every: Duration, enabled: bool) -> (Arc<dyn Job>, Duration, bool) {
    let job: Arc<dyn Job> = Arc::new(job);
    (job, every, enabled)
}

pub fn cooldown_key(job: &str) -> String {
    format!("jobs:{job}:last_run")
}

fn next_due(last_run: Option<DateTime<Utc>>, cooldown: Duration) -> Option<DateTime<Utc>> {
    if cooldown.is_zero() {
        return None;
    }
    let gap = chrono::Duration::from_std(cooldown).ok()?;
    last_run?.checked_add_signed(gap)
}
