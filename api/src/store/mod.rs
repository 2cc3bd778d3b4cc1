//! Per-user listening activity.
//!
//! [`ActivityStore`] owns the record semantics (lazy defaults, full overwrite,
//! action append with a history cap, derived stats) and delegates persistence
//! to a [`RecordBackend`]. HTTP handlers and the CLI only ever talk to
//! `ActivityStore`.
//!
//! Every mutation is a load-modify-save against the backend with no per-user
//! lock, so two concurrent actions for the same user can lose one of the
//! updates. Different users never interfere.

use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{
    Action, ActivityEntry, HistoryKind, HistoryLists, RecentActivity, TopGenre, Track,
    UserRecord, UserStats,
};

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

const TOP_GENRES: usize = 5;
const RECENT_ACTIVITY: usize = 20;

#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// `Ok(None)` when nothing has been saved for `user_id` yet.
    async fn load(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn save(&self, record: &UserRecord) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone)]
pub struct ActivityStore {
    backend: Arc<dyn RecordBackend>,
    clock: Arc<dyn Clock>,
    history_cap: usize,
}

impl ActivityStore {
    pub fn new(backend: Arc<dyn RecordBackend>, history_cap: usize) -> Self {
        Self::with_clock(backend, history_cap, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backend: Arc<dyn RecordBackend>,
        history_cap: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            clock,
            history_cap,
        }
    }

    /// The stored record, or a fresh default that is not persisted.
    pub async fn get(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        match self.backend.load(user_id).await? {
            Some(record) => Ok(record),
            None => {
                tracing::debug!("no record for {}, returning default", user_id);
                Ok(UserRecord::new_default(user_id, self.clock.now()))
            }
        }
    }

    /// Replaces the whole record. Only `userId` and `lastUpdated` are decided
    /// by the store; anything the caller left out is reset to its default.
    pub async fn put(&self, user_id: &str, mut record: UserRecord) -> Result<(), StoreError> {
        record.user_id = user_id.to_string();
        record.last_updated = self.clock.now();
        self.backend.save(&record).await
    }

    /// Appends one action. `action` outside `play | like | skip` leaves history
    /// and counters alone but the record is still touched and saved.
    pub async fn record_action(
        &self,
        user_id: &str,
        action: &str,
        track: Track,
    ) -> Result<(), StoreError> {
        let mut record = self.get(user_id).await?;
        let now = self.clock.now();

        match Action::parse(action) {
            Some(action) => record.record(action, ActivityEntry::new(track, now)),
            None => tracing::warn!("ignoring unknown action {:?} for {}", action, user_id),
        }

        record.history.truncate_to(self.history_cap);
        record.user_id = user_id.to_string();
        record.last_updated = now;
        self.backend.save(&record).await
    }

    pub async fn derive_stats(&self, user_id: &str) -> Result<UserStats, StoreError> {
        let record = self.get(user_id).await?;
        Ok(summarize(&record))
    }

    pub async fn list_history(&self, user_id: &str) -> Result<HistoryLists, StoreError> {
        let record = self.get(user_id).await?;
        Ok(record.history.into())
    }

    pub async fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        self.backend.list().await
    }
}

/// Stats are read off the current (capped) history, not the lifetime counters.
pub fn summarize(record: &UserRecord) -> UserStats {
    let history = &record.history;

    UserStats {
        total_played: history.played.len(),
        total_liked: history.liked.len(),
        total_skipped: history.skipped.len(),
        top_genres: top_genres(&record.user_preferences.genre_scores, TOP_GENRES),
        recent_activity: recent_activity(record, RECENT_ACTIVITY),
    }
}

fn top_genres(scores: &serde_json::Map<String, serde_json::Value>, limit: usize) -> Vec<TopGenre> {
    let mut ranked: Vec<(f64, &String, &serde_json::Value)> = scores
        .iter()
        .filter_map(|(genre, score)| score.as_f64().map(|rank| (rank, genre, score)))
        .collect();

    // stable, so equal scores stay in insertion order
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked
        .into_iter()
        .take(limit)
        .map(|(_, genre, score)| TopGenre {
            genre: genre.clone(),
            score: score.clone(),
        })
        .collect()
}

fn recent_activity(record: &UserRecord, limit: usize) -> Vec<RecentActivity> {
    let history = &record.history;
    let tagged = |entries: &[ActivityEntry], action: HistoryKind| {
        entries
            .iter()
            .cloned()
            .map(move |entry| RecentActivity { entry, action })
            .collect::<Vec<_>>()
    };

    let mut all = tagged(history.played.as_slice(), HistoryKind::Played);
    all.extend(tagged(history.liked.as_slice(), HistoryKind::Liked));
    all.extend(tagged(history.skipped.as_slice(), HistoryKind::Skipped));

    // newest first; timestamps that do not parse sink to the end
    all.sort_by_cached_key(|a| Reverse(a.entry.parsed_timestamp()));
    all.truncate(limit);
    all
}
