//! # Leaderboard — Ranked Standings from Progress Records
//!
//! Standings are derived, never stored as the system of record. Each user's
//! aggregate is a [`UserTally`]: one [`Contribution`] per passed level, keyed
//! by level id. Because the tally is a pure function of the *set* of passed
//! completions, applying them in any order (or applying one twice) yields the
//! same aggregate.
//!
//! ## Ordering
//!
//! 1. `levels_completed` descending
//! 2. `total_score` descending
//! 3. `last_completion_at` ascending (earlier finisher wins)
//! 4. `user_id` ascending (total order, so ranks are deterministic)
//!
//! Rank is the 1-based position in that order.
//!
//! ## Strategies
//!
//! [`Standings`] has two implementations with identical results:
//! [`ComputeOnRead`] scans passed records on every read; [`IncrementalStandings`]
//! keeps a per-event cache updated on each completion and cold-loaded from a
//! scan the first time an event is read.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::model::{EventId, LevelId, ProgressRecord, UserId};
use crate::retry::RetryPolicy;
use crate::store::ProgressStore;

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 200;

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Scoring ─────────────────────────────────────────────────────

/// Extracts the numeric score from a completion's `result_data`.
#[derive(Debug, Clone)]
pub struct ScoreRule {
    field: String,
}

impl ScoreRule {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Missing, non-numeric, or non-finite values score 0. Clients that send
    /// `result_data` as a JSON-encoded string are parsed first.
    pub fn score(&self, result_data: Option<&Value>) -> f64 {
        let parsed;
        let data = match result_data {
            Some(Value::String(s)) => {
                parsed = serde_json::from_str::<Value>(s).ok();
                parsed.as_ref()
            }
            other => other,
        };
        let value = match data.and_then(|d| d.get(&self.field)) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        if value.is_finite() {
            value
        } else {
            0.0
        }
    }
}

impl Default for ScoreRule {
    fn default() -> Self {
        Self::new("score")
    }
}

// ── Tallies ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub score: f64,
    pub time_taken_seconds: i64,
    pub completed_at: DateTime<Utc>,
}

impl Contribution {
    pub fn from_record(record: &ProgressRecord, rule: &ScoreRule) -> Self {
        Self {
            score: rule.score(record.result_data.as_ref()),
            time_taken_seconds: record.time_taken_seconds.unwrap_or(0),
            completed_at: record.completed_at.unwrap_or(record.started_at),
        }
    }
}

/// One user's aggregate over their passed levels in an event.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTally {
    pub user_id: UserId,
    pub levels: BTreeMap<LevelId, Contribution>,
}

impl UserTally {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            levels: BTreeMap::new(),
        }
    }

    /// Record a passed level. The first contribution for a level wins;
    /// re-applying the same completion is a no-op.
    pub fn apply(&mut self, level_id: LevelId, contribution: Contribution) {
        self.levels.entry(level_id).or_insert(contribution);
    }

    pub fn levels_completed(&self) -> usize {
        self.levels.len()
    }

    /// Summed in level-id order so every strategy produces bit-identical
    /// floating point totals.
    pub fn total_score(&self) -> f64 {
        self.levels.values().map(|c| c.score).sum()
    }

    pub fn total_time_seconds(&self) -> i64 {
        self.levels.values().map(|c| c.time_taken_seconds).sum()
    }

    pub fn last_completion_at(&self) -> Option<DateTime<Utc>> {
        self.levels.values().map(|c| c.completed_at).max()
    }

    pub fn has_passed_all(&self, level_ids: &[LevelId]) -> bool {
        !level_ids.is_empty() && level_ids.iter().all(|id| self.levels.contains_key(id))
    }
}

/// Build tallies from a batch of records, ignoring anything not passed.
pub fn tally_records(records: &[ProgressRecord], rule: &ScoreRule) -> HashMap<UserId, UserTally> {
    let mut tallies: HashMap<UserId, UserTally> = HashMap::new();
    for record in records.iter().filter(|r| r.state.is_passed()) {
        tallies
            .entry(record.user_id)
            .or_insert_with(|| UserTally::new(record.user_id))
            .apply(record.level_id, Contribution::from_record(record, rule));
    }
    tallies
}

/// Total order over tallies: best first.
pub fn compare_tallies(a: &UserTally, b: &UserTally) -> Ordering {
    b.levels_completed()
        .cmp(&a.levels_completed())
        .then_with(|| b.total_score().total_cmp(&a.total_score()))
        .then_with(|| a.last_completion_at().cmp(&b.last_completion_at()))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sort tallies into rank order. Rank of `tallies[i]` is `i + 1`.
pub fn rank_tallies(mut tallies: Vec<UserTally>) -> Vec<UserTally> {
    tallies.retain(|t| !t.levels.is_empty());
    tallies.sort_by(compare_tallies);
    tallies
}

pub fn badge_for_rank(rank: usize) -> Option<&'static str> {
    match rank {
        1 => Some("gold"),
        2 => Some("silver"),
        3 => Some("bronze"),
        _ => None,
    }
}

// ── Strategies ──────────────────────────────────────────────────

#[async_trait]
pub trait Standings: Send + Sync {
    /// Observe a completion. Non-passed records are ignored.
    async fn record_completion(&self, record: &ProgressRecord) -> anyhow::Result<()>;

    /// Current tallies for every user with at least one passed level.
    async fn tallies(&self, event_id: EventId) -> anyhow::Result<Vec<UserTally>>;
}

pub struct ComputeOnRead {
    store: Arc<dyn ProgressStore>,
    rule: ScoreRule,
}

impl ComputeOnRead {
    pub fn new(store: Arc<dyn ProgressStore>, rule: ScoreRule) -> Self {
        Self { store, rule }
    }
}

#[async_trait]
impl Standings for ComputeOnRead {
    async fn record_completion(&self, _record: &ProgressRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn tallies(&self, event_id: EventId) -> anyhow::Result<Vec<UserTally>> {
        let records = self.store.passed_progress(event_id).await?;
        Ok(tally_records(&records, &self.rule).into_values().collect())
    }
}

#[derive(Default)]
struct EventStandings {
    loaded: bool,
    users: HashMap<UserId, UserTally>,
}

impl EventStandings {
    fn apply(&mut self, user_id: UserId, level_id: LevelId, contribution: Contribution) {
        self.users
            .entry(user_id)
            .or_insert_with(|| UserTally::new(user_id))
            .apply(level_id, contribution);
    }
}

pub struct IncrementalStandings {
    store: Arc<dyn ProgressStore>,
    rule: ScoreRule,
    events: Mutex<HashMap<EventId, EventStandings>>,
}

impl IncrementalStandings {
    pub fn new(store: Arc<dyn ProgressStore>, rule: ScoreRule) -> Self {
        Self {
            store,
            rule,
            events: Mutex::new(HashMap::new()),
        }
    }

    fn is_loaded(&self, event_id: EventId) -> bool {
        lock_or_recover(&self.events)
            .get(&event_id)
            .is_some_and(|e| e.loaded)
    }

    /// Merge a full scan into the cache. Completions applied while the scan
    /// was in flight are kept: the merge is a union keyed by level.
    async fn cold_load(&self, event_id: EventId) -> anyhow::Result<()> {
        let records = self.store.passed_progress(event_id).await?;
        let mut events = lock_or_recover(&self.events);
        let standings = events.entry(event_id).or_default();
        for record in records.iter().filter(|r| r.state.is_passed()) {
            standings.apply(
                record.user_id,
                record.level_id,
                Contribution::from_record(record, &self.rule),
            );
        }
        standings.loaded = true;
        tracing::debug!(event_id, users = standings.users.len(), "standings cache loaded");
        Ok(())
    }
}

#[async_trait]
impl Standings for IncrementalStandings {
    async fn record_completion(&self, record: &ProgressRecord) -> anyhow::Result<()> {
        if !record.state.is_passed() {
            return Ok(());
        }
        let contribution = Contribution::from_record(record, &self.rule);
        lock_or_recover(&self.events)
            .entry(record.event_id)
            .or_default()
            .apply(record.user_id, record.level_id, contribution);
        Ok(())
    }

    async fn tallies(&self, event_id: EventId) -> anyhow::Result<Vec<UserTally>> {
        if !self.is_loaded(event_id) {
            self.cold_load(event_id).await?;
        }
        Ok(lock_or_recover(&self.events)
            .get(&event_id)
            .map(|e| e.users.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ── Queries ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderboardFilter {
    All,
    /// Users who passed every enabled level of the event.
    Completed,
    Group(String),
}

impl FromStr for LeaderboardFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(LeaderboardFilter::All),
            "completed" => Ok(LeaderboardFilter::Completed),
            _ => match s.strip_prefix("group:") {
                Some(name) if !name.trim().is_empty() => {
                    Ok(LeaderboardFilter::Group(name.trim().to_string()))
                }
                _ => Err(EngineError::InvalidFilter(s.to_string())),
            },
        }
    }
}

impl std::fmt::Display for LeaderboardFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderboardFilter::All => write!(f, "all"),
            LeaderboardFilter::Completed => write!(f, "completed"),
            LeaderboardFilter::Group(name) => write!(f, "group:{}", name),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: UserId,
    pub display_name: String,
    pub levels_completed: usize,
    pub total_score: f64,
    pub total_time_seconds: i64,
    pub last_completion_at: Option<DateTime<Utc>>,
    pub all_levels_completed: bool,
    pub badge: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub event_id: EventId,
    pub filter: String,
    pub entries: Vec<LeaderboardEntry>,
    pub total: usize,
    pub total_participants: i64,
    pub current_user_rank: Option<usize>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MyRank {
    pub rank: usize,
    pub total: usize,
    pub entry: LeaderboardEntry,
}

pub struct LeaderboardAggregator {
    store: Arc<dyn ProgressStore>,
    standings: Arc<dyn Standings>,
    retry: RetryPolicy,
}

impl LeaderboardAggregator {
    pub fn new(store: Arc<dyn ProgressStore>, standings: Arc<dyn Standings>, retry: RetryPolicy) -> Self {
        Self {
            store,
            standings,
            retry,
        }
    }

    pub async fn record_completion(&self, record: &ProgressRecord) -> Result<(), EngineError> {
        self.retry
            .run("standings.record_completion", || self.standings.record_completion(record))
            .await
    }

    /// Every ranked tally for the event (filter `all`), plus the enabled
    /// level ids used for `all_levels_completed`.
    async fn ranked(&self, event_id: EventId) -> Result<(Vec<UserTally>, Vec<LevelId>), EngineError> {
        self.retry
            .run("get_event", || self.store.get_event(event_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event_id)))?;
        let levels = self
            .retry
            .run("get_levels", || self.store.get_levels(event_id))
            .await?;
        let level_ids: Vec<LevelId> = levels.iter().map(|l| l.level_id).collect();
        let tallies = self
            .retry
            .run("standings.tallies", || self.standings.tallies(event_id))
            .await?;
        Ok((rank_tallies(tallies), level_ids))
    }

    async fn entries_for(
        &self,
        page: &[(usize, &UserTally)],
        level_ids: &[LevelId],
    ) -> Result<Vec<LeaderboardEntry>, EngineError> {
        let ids: Vec<UserId> = page.iter().map(|(_, t)| t.user_id).collect();
        let users = self
            .retry
            .run("get_users", || self.store.get_users(&ids))
            .await?;
        let names: HashMap<UserId, String> = users
            .into_iter()
            .map(|u| (u.user_id, u.display_name))
            .collect();
        Ok(page
            .iter()
            .map(|(rank, tally)| LeaderboardEntry {
                rank: *rank,
                user_id: tally.user_id,
                display_name: names
                    .get(&tally.user_id)
                    .cloned()
                    .unwrap_or_else(|| "Anonymous".to_string()),
                levels_completed: tally.levels_completed(),
                total_score: tally.total_score(),
                total_time_seconds: tally.total_time_seconds(),
                last_completion_at: tally.last_completion_at(),
                all_levels_completed: tally.has_passed_all(level_ids),
                badge: badge_for_rank(*rank),
            })
            .collect())
    }

    pub async fn get_leaderboard(
        &self,
        event_id: EventId,
        filter: &LeaderboardFilter,
        limit: Option<u32>,
        offset: Option<u32>,
        caller: Option<UserId>,
    ) -> Result<Leaderboard, EngineError> {
        let (ranked, level_ids) = self.ranked(event_id).await?;

        let members: Option<HashSet<UserId>> = match filter {
            LeaderboardFilter::Group(name) => {
                let members = self
                    .retry
                    .run("get_group_members", || self.store.get_group_members(event_id, name))
                    .await?
                    .ok_or_else(|| EngineError::InvalidFilter(filter.to_string()))?;
                Some(members.into_iter().collect())
            }
            _ => None,
        };
        let filtered: Vec<&UserTally> = ranked
            .iter()
            .filter(|t| match filter {
                LeaderboardFilter::All => true,
                LeaderboardFilter::Completed => t.has_passed_all(&level_ids),
                LeaderboardFilter::Group(_) => {
                    members.as_ref().is_some_and(|m| m.contains(&t.user_id))
                }
            })
            .collect();

        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = offset.unwrap_or(0);
        let total = filtered.len();
        let current_user_rank = caller
            .and_then(|id| filtered.iter().position(|t| t.user_id == id))
            .map(|idx| idx + 1);

        let page: Vec<(usize, &UserTally)> = filtered
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(idx, t)| (idx + 1, *t))
            .collect();
        let entries = self.entries_for(&page, &level_ids).await?;
        let total_participants = self
            .retry
            .run("count_participants", || self.store.count_participants(event_id))
            .await?;

        Ok(Leaderboard {
            event_id,
            filter: filter.to_string(),
            entries,
            total,
            total_participants,
            current_user_rank,
            limit,
            offset,
        })
    }

    pub async fn get_my_rank(&self, event_id: EventId, user_id: UserId) -> Result<MyRank, EngineError> {
        let (ranked, level_ids) = self.ranked(event_id).await?;
        let idx = ranked
            .iter()
            .position(|t| t.user_id == user_id)
            .ok_or_else(|| EngineError::NotFound(format!("leaderboard entry for user {}", user_id)))?;
        let mut entries = self.entries_for(&[(idx + 1, &ranked[idx])], &level_ids).await?;
        let entry = entries
            .pop()
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("ranked entry vanished")))?;
        Ok(MyRank {
            rank: idx + 1,
            total: ranked.len(),
            entry,
        })
    }
}
