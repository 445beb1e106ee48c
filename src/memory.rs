//! # Memory — In-Process Store
//!
//! A [`ProgressStore`] backed by hash maps, used by the test suites and by
//! `utsav serve --memory` for local play without PostgreSQL.
//!
//! Progress is sharded per user: each user owns an `Arc<Mutex<Vec<_>>>`, so
//! the create-or-fetch and conditional-complete checks are atomic for one user
//! while writes for different users never contend on the same lock. No lock is
//! ever held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Completion, Event, EventId, Level, LevelId, NewProgress, Outcome, ProgressId, ProgressRecord,
    ProgressState, User, UserId,
};
use crate::store::{timeout_result, ProgressStore};

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct OtpChallenge {
    code_hash: String,
    expires_at: DateTime<Utc>,
    consumed: bool,
}

type UserShard = Arc<Mutex<Vec<ProgressRecord>>>;

#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<HashMap<EventId, Event>>,
    levels: RwLock<HashMap<EventId, Vec<Level>>>,
    groups: RwLock<HashMap<(EventId, String), Vec<UserId>>>,
    users: RwLock<HashMap<UserId, User>>,
    otps: Mutex<HashMap<String, Vec<OtpChallenge>>>,
    progress: RwLock<HashMap<UserId, UserShard>>,
    progress_owner: RwLock<HashMap<ProgressId, UserId>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    /// A store pre-loaded with one active event (`qr_token = "DEMO"`) and
    /// five enabled levels, the last of which is final.
    pub fn with_demo_event() -> Self {
        let store = Self::new();
        let event = store.add_event("Demo Event", "DEMO");
        for (order, game) in ["memory", "puzzle", "quiz", "spot", "guess"].iter().enumerate() {
            store.add_level(event.event_id, order as i32 + 1, game, order == 4);
        }
        store
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_event(&self, name: &str, qr_token: &str) -> Event {
        let event = Event {
            event_id: self.next_id(),
            name: name.to_string(),
            qr_token: qr_token.to_string(),
            is_active: true,
            description: None,
            created_at: Utc::now(),
        };
        write_or_recover(&self.events).insert(event.event_id, event.clone());
        event
    }

    pub fn set_event_active(&self, event_id: EventId, is_active: bool) {
        if let Some(event) = write_or_recover(&self.events).get_mut(&event_id) {
            event.is_active = is_active;
        }
    }

    pub fn add_level(&self, event_id: EventId, level_order: i32, game_type: &str, is_final: bool) -> Level {
        let level = Level {
            level_id: self.next_id(),
            event_id,
            level_order,
            game_type: game_type.to_string(),
            pass_criteria: None,
            is_final,
            is_enabled: true,
        };
        let mut levels = write_or_recover(&self.levels);
        let list = levels.entry(event_id).or_default();
        list.push(level.clone());
        list.sort_by_key(|l| l.level_order);
        level
    }

    pub fn disable_level(&self, event_id: EventId, level_id: LevelId) {
        if let Some(list) = write_or_recover(&self.levels).get_mut(&event_id) {
            for level in list.iter_mut().filter(|l| l.level_id == level_id) {
                level.is_enabled = false;
            }
        }
    }

    pub fn add_user(&self, phone_number: &str, display_name: &str) -> User {
        let now = Utc::now();
        let user = User {
            user_id: uuid::Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            updated_at: now,
        };
        write_or_recover(&self.users).insert(user.user_id, user.clone());
        user
    }

    pub fn add_group_member(&self, event_id: EventId, group: &str, user_id: UserId) {
        write_or_recover(&self.groups)
            .entry((event_id, group.to_string()))
            .or_default()
            .push(user_id);
    }

    fn shard(&self, user_id: UserId) -> Option<UserShard> {
        read_or_recover(&self.progress).get(&user_id).cloned()
    }

    fn shard_or_create(&self, user_id: UserId) -> UserShard {
        if let Some(shard) = self.shard(user_id) {
            return shard;
        }
        write_or_recover(&self.progress)
            .entry(user_id)
            .or_default()
            .clone()
    }

    fn all_shards(&self) -> Vec<UserShard> {
        read_or_recover(&self.progress).values().cloned().collect()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>> {
        Ok(read_or_recover(&self.events).get(&event_id).cloned())
    }

    async fn get_event_by_qr(&self, qr_token: &str) -> Result<Option<Event>> {
        Ok(read_or_recover(&self.events)
            .values()
            .find(|e| e.qr_token == qr_token)
            .cloned())
    }

    async fn get_levels(&self, event_id: EventId) -> Result<Vec<Level>> {
        Ok(read_or_recover(&self.levels)
            .get(&event_id)
            .map(|list| list.iter().filter(|l| l.is_enabled).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_group_members(
        &self,
        event_id: EventId,
        group: &str,
    ) -> Result<Option<Vec<UserId>>> {
        Ok(read_or_recover(&self.groups)
            .get(&(event_id, group.to_string()))
            .cloned())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(read_or_recover(&self.users).get(&user_id).cloned())
    }

    async fn get_users(&self, user_ids: &[UserId]) -> Result<Vec<User>> {
        let users = read_or_recover(&self.users);
        Ok(user_ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn get_user_by_phone(&self, phone_number: &str) -> Result<Option<User>> {
        Ok(read_or_recover(&self.users)
            .values()
            .find(|u| u.phone_number == phone_number)
            .cloned())
    }

    async fn create_user(&self, phone_number: &str, display_name: &str) -> Result<User> {
        let mut users = write_or_recover(&self.users);
        if let Some(existing) = users.values().find(|u| u.phone_number == phone_number) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let user = User {
            user_id: uuid::Uuid::new_v4(),
            phone_number: phone_number.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            updated_at: now,
        };
        users.insert(user.user_id, user.clone());
        Ok(user)
    }

    async fn update_display_name(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<Option<User>> {
        let mut users = write_or_recover(&self.users);
        Ok(users.get_mut(&user_id).map(|u| {
            u.display_name = display_name.to_string();
            u.updated_at = Utc::now();
            u.clone()
        }))
    }

    async fn store_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut otps = lock_or_recover(&self.otps);
        let list = otps.entry(phone_number.to_string()).or_default();
        for challenge in list.iter_mut() {
            challenge.consumed = true;
        }
        list.push(OtpChallenge {
            code_hash: code_hash.to_string(),
            expires_at,
            consumed: false,
        });
        Ok(())
    }

    async fn consume_otp(
        &self,
        phone_number: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut otps = lock_or_recover(&self.otps);
        let Some(list) = otps.get_mut(phone_number) else {
            return Ok(false);
        };
        match list
            .iter_mut()
            .rev()
            .find(|c| !c.consumed && c.code_hash == code_hash && c.expires_at > now)
        {
            Some(challenge) => {
                challenge.consumed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<Vec<ProgressRecord>> {
        let Some(shard) = self.shard(user_id) else {
            return Ok(Vec::new());
        };
        let records = lock_or_recover(&shard);
        Ok(records
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn get_progress(&self, progress_id: ProgressId) -> Result<Option<ProgressRecord>> {
        let Some(owner) = read_or_recover(&self.progress_owner).get(&progress_id).copied() else {
            return Ok(None);
        };
        let Some(shard) = self.shard(owner) else {
            return Ok(None);
        };
        let records = lock_or_recover(&shard);
        Ok(records.iter().find(|r| r.progress_id == progress_id).cloned())
    }

    async fn find_progress(
        &self,
        user_id: UserId,
        event_id: EventId,
        level_id: LevelId,
    ) -> Result<Option<ProgressRecord>> {
        let Some(shard) = self.shard(user_id) else {
            return Ok(None);
        };
        let records = lock_or_recover(&shard);
        Ok(records
            .iter()
            .find(|r| r.event_id == event_id && r.level_id == level_id)
            .cloned())
    }

    async fn insert_progress(&self, new: &NewProgress) -> Result<(ProgressRecord, bool)> {
        let shard = self.shard_or_create(new.user_id);
        let mut records = lock_or_recover(&shard);
        if let Some(existing) = records
            .iter()
            .find(|r| r.event_id == new.event_id && r.level_id == new.level_id)
        {
            let created = existing.progress_id == new.progress_id;
            return Ok((existing.clone(), created));
        }
        let record = ProgressRecord {
            progress_id: new.progress_id,
            user_id: new.user_id,
            event_id: new.event_id,
            level_id: new.level_id,
            state: ProgressState::InProgress,
            started_at: new.started_at,
            completed_at: None,
            time_taken_seconds: None,
            result_data: None,
            device_info: new.device_info.clone(),
            game_state: None,
        };
        records.push(record.clone());
        write_or_recover(&self.progress_owner).insert(record.progress_id, record.user_id);
        Ok((record, true))
    }

    async fn complete_progress(&self, completion: &Completion) -> Result<Option<ProgressRecord>> {
        let Some(shard) = self.shard(completion.user_id) else {
            return Ok(None);
        };
        let mut records = lock_or_recover(&shard);
        let Some(record) = records.iter_mut().find(|r| {
            r.progress_id == completion.progress_id && r.state == ProgressState::InProgress
        }) else {
            return Ok(None);
        };
        record.state = ProgressState::Completed(completion.outcome);
        record.completed_at = Some(completion.completed_at);
        record.time_taken_seconds = Some(completion.time_taken_seconds);
        record.result_data = Some(completion.result_data.clone());
        if completion.device_info.is_some() {
            record.device_info = completion.device_info.clone();
        }
        Ok(Some(record.clone()))
    }

    async fn save_game_state(
        &self,
        progress_id: ProgressId,
        user_id: UserId,
        game_state: &serde_json::Value,
    ) -> Result<Option<ProgressRecord>> {
        let Some(shard) = self.shard(user_id) else {
            return Ok(None);
        };
        let mut records = lock_or_recover(&shard);
        Ok(records
            .iter_mut()
            .find(|r| r.progress_id == progress_id && r.state == ProgressState::InProgress)
            .map(|record| {
                record.game_state = Some(game_state.clone());
                record.clone()
            }))
    }

    async fn passed_progress(&self, event_id: EventId) -> Result<Vec<ProgressRecord>> {
        let mut out = Vec::new();
        for shard in self.all_shards() {
            let records = lock_or_recover(&shard);
            out.extend(
                records
                    .iter()
                    .filter(|r| r.event_id == event_id && r.state.is_passed())
                    .cloned(),
            );
        }
        Ok(out)
    }

    async fn count_participants(&self, event_id: EventId) -> Result<i64> {
        let mut count = 0;
        for shard in self.all_shards() {
            if lock_or_recover(&shard).iter().any(|r| r.event_id == event_id) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn expire_stale_progress(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProgressRecord>> {
        let mut expired = Vec::new();
        for shard in self.all_shards() {
            let mut records = lock_or_recover(&shard);
            for record in records
                .iter_mut()
                .filter(|r| r.state == ProgressState::InProgress && r.started_at < cutoff)
            {
                record.state = ProgressState::Completed(Outcome::Failed);
                record.completed_at = Some(now);
                record.time_taken_seconds = Some((now - record.started_at).num_seconds().max(0));
                record.result_data = Some(timeout_result());
                expired.push(record.clone());
            }
        }
        Ok(expired)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
