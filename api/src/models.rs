use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::identity;

/// A track as the client sends it. The store never interprets its fields beyond
/// `title` and `singer`, so it is kept as the raw JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Track(pub Map<String, Value>);

impl Track {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn text(&self, key: &str) -> String {
        display_value(self.0.get(key))
    }
}

/// Renders a JSON value the way string concatenation would: strings raw,
/// absent values as `undefined`, anything else as its JSON text.
pub fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "undefined".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Play,
    Like,
    Skip,
}

impl Action {
    /// Returns `None` for anything outside `play | like | skip`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "play" => Some(Action::Play),
            "like" => Some(Action::Like),
            "skip" => Some(Action::Skip),
            _ => None,
        }
    }

    pub fn history_kind(self) -> HistoryKind {
        match self {
            Action::Play => HistoryKind::Played,
            Action::Like => HistoryKind::Liked,
            Action::Skip => HistoryKind::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Played,
    Liked,
    Skipped,
}

/// ISO-8601 with milliseconds and a `Z` suffix, e.g. `2024-05-01T10:00:00.000Z`.
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn serialize_iso_millis<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&iso_millis(*at))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    #[serde(flatten)]
    pub track: Track,
    /// Kept exactly as written so saved records read back unchanged.
    pub timestamp: String,
    #[serde(rename = "trackId")]
    pub track_id: String,
}

impl ActivityEntry {
    pub fn new(mut track: Track, timestamp: DateTime<Utc>) -> Self {
        let track_id = identity::legacy_track_id(&track);
        // store-assigned keys win over whatever the client sent
        track.0.shift_remove("timestamp");
        track.0.shift_remove("trackId");
        Self {
            track,
            timestamp: iso_millis(timestamp),
            track_id,
        }
    }

    /// `None` when the stored timestamp is not RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

/// Lifetime action counters. These only ever grow, so they drift from the
/// history lengths once the history cap starts dropping entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub played: u64,
    #[serde(default)]
    pub liked: u64,
    #[serde(default)]
    pub disliked: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    #[serde(default)]
    pub plays: Map<String, Value>,
    #[serde(default)]
    pub likes: Vec<Value>,
    #[serde(default)]
    pub dislikes: Vec<Value>,
    #[serde(default)]
    pub genre_scores: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub played: Vec<ActivityEntry>,
    #[serde(default)]
    pub liked: Vec<ActivityEntry>,
    #[serde(default)]
    pub skipped: Vec<ActivityEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl History {
    pub fn entries_mut(&mut self, kind: HistoryKind) -> &mut Vec<ActivityEntry> {
        match kind {
            HistoryKind::Played => &mut self.played,
            HistoryKind::Liked => &mut self.liked,
            HistoryKind::Skipped => &mut self.skipped,
        }
    }

    /// Keeps only the newest `cap` entries of every list.
    pub fn truncate_to(&mut self, cap: usize) {
        for entries in [&mut self.played, &mut self.liked, &mut self.skipped] {
            if entries.len() > cap {
                let excess = entries.len() - cap;
                entries.drain(..excess);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub stats: Counters,
    #[serde(default)]
    pub user_preferences: UserPreferences,
    #[serde(default)]
    pub history: History,
    #[serde(default = "Utc::now", serialize_with = "serialize_iso_millis")]
    pub last_updated: DateTime<Utc>,
    /// Top-level keys this server does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    pub fn new_default(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            stats: Counters::default(),
            user_preferences: UserPreferences::default(),
            history: History::default(),
            last_updated: now,
            extra: Map::new(),
        }
    }

    pub fn record(&mut self, action: Action, entry: ActivityEntry) {
        self.history.entries_mut(action.history_kind()).push(entry);
        match action {
            Action::Play => self.stats.played += 1,
            Action::Like => self.stats.liked += 1,
            Action::Skip => self.stats.disliked += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopGenre {
    pub genre: String,
    /// The number as the client stored it, so `5` stays `5`.
    pub score: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentActivity {
    #[serde(flatten)]
    pub entry: ActivityEntry,
    pub action: HistoryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_played: usize,
    pub total_liked: usize,
    pub total_skipped: usize,
    pub top_genres: Vec<TopGenre>,
    pub recent_activity: Vec<RecentActivity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryLists {
    pub played: Vec<ActivityEntry>,
    pub liked: Vec<ActivityEntry>,
    pub skipped: Vec<ActivityEntry>,
}

impl From<History> for HistoryLists {
    fn from(history: History) -> Self {
        Self {
            played: history.played,
            liked: history.liked,
            skipped: history.skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn track(value: Value) -> Track {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_entry_overrides_client_timestamp() {
        let now = Utc::now();
        let entry = ActivityEntry::new(
            track(json!({"title": "Gol", "singer": "Sina", "timestamp": "yesterday", "trackId": "x"})),
            now,
        );

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["trackId"], "Gol_Sina");
        assert_eq!(value["title"], "Gol");
        assert_eq!(value["timestamp"], iso_millis(now));
        assert_eq!(
            entry.parsed_timestamp().unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_timestamps_use_millisecond_form() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(iso_millis(at), "2024-05-01T10:00:00.000Z");

        let record = UserRecord::new_default("u1", at);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["lastUpdated"], "2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn test_nested_extras_survive_round_trip() {
        let raw = json!({
            "stats": {"played": 1, "liked": 0, "disliked": 0, "skipped": 4},
            "history": {
                "played": [{"title": "A", "timestamp": "2024-05-01T10:00:00.000Z", "trackId": "A_s"}],
                "liked": [],
                "skipped": [],
                "queued": []
            }
        });
        let record: UserRecord = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&record).unwrap();

        assert_eq!(back["stats"], raw["stats"]);
        assert_eq!(back["history"], raw["history"]);
    }

    #[test]
    fn test_partial_record_fills_defaults() {
        let record: UserRecord = serde_json::from_value(json!({
            "stats": {"played": 3},
            "theme": "dark"
        }))
        .unwrap();

        assert_eq!(record.stats.played, 3);
        assert_eq!(record.stats.liked, 0);
        assert!(record.history.played.is_empty());
        assert_eq!(record.extra.get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn test_truncate_keeps_newest() {
        let now = Utc::now();
        let mut history = History::default();
        for i in 0..5 {
            history
                .played
                .push(ActivityEntry::new(track(json!({"title": i, "singer": "a"})), now));
        }
        history.truncate_to(3);

        let ids: Vec<_> = history.played.iter().map(|e| e.track_id.as_str()).collect();
        assert_eq!(ids, vec!["2_a", "3_a", "4_a"]);
    }

    #[test]
    fn test_unknown_action() {
        assert_eq!(Action::parse("play"), Some(Action::Play));
        assert_eq!(Action::parse("dislike"), None);
        assert_eq!(Action::parse("PLAY"), None);
    }
}
