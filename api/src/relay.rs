use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::LlmConfig;
use crate::error::RelayError;
use crate::models::{display_value as text, Track};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROMPT_TRACK_LIMIT: usize = 50;
const PROMPT_GENRE_LIMIT: usize = 3;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeContext {
    #[serde(default)]
    pub time_of_day: Option<Value>,
    #[serde(default)]
    pub hour: Option<Value>,
    #[serde(default)]
    pub day: Option<Value>,
    #[serde(default)]
    pub mood: Option<Value>,
    #[serde(default)]
    pub energy: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerPreferences {
    #[serde(default)]
    pub likes: Vec<Value>,
    #[serde(default)]
    pub dislikes: Vec<Value>,
    #[serde(default)]
    pub genre_scores: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistRequest {
    #[serde(default)]
    pub time_context: TimeContext,
    #[serde(default)]
    pub user_preferences: ListenerPreferences,
    #[serde(default)]
    pub available_tracks: Vec<Track>,
    #[serde(default)]
    pub requested_length: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<Value>,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

fn top_genre_names(scores: &Map<String, Value>, limit: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, f64)> = scores
        .iter()
        .filter_map(|(genre, score)| score.as_f64().map(|s| (genre, s)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(limit)
        .map(|(genre, _)| genre.clone())
        .collect()
}

fn track_line(track: &Track) -> String {
    format!(
        "ID: {} | \"{}\" by {} | Genres: {}, {} | Moods: {}, {}, {} | {}",
        track.text("id"),
        track.text("title"),
        track.text("singer"),
        track.text("genre1"),
        track.text("genre2"),
        track.text("mood1"),
        track.text("mood2"),
        track.text("mood3"),
        track.text("prompt"),
    )
}

pub fn build_prompt(request: &PlaylistRequest) -> String {
    let time = &request.time_context;
    let prefs = &request.user_preferences;

    let track_lines = request
        .available_tracks
        .iter()
        .take(PROMPT_TRACK_LIMIT)
        .map(track_line)
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a music curator AI. Create a personalized playlist based on this data:

TIME CONTEXT: {time_of_day} ({hour}:00) on {day}
MOOD: {mood}
ENERGY LEVEL: {energy}

USER PREFERENCES:
- Liked tracks: {likes} songs
- Disliked tracks: {dislikes} songs
- Top genres: {genres}

AVAILABLE TRACKS: {available} songs

PLAYLIST TYPE: {kind}

Select {length} tracks that best match the current time/mood and user preferences.

Available tracks:
{track_lines}

Return a JSON object with this exact format:
{{
  "title": "Playlist Name Here",
  "description": "Brief explanation of why this playlist fits the current time and user preferences",
  "playlist": [
    {{"id": "track_id_from_available_tracks", "reason": "why this track was selected"}},
    {{"id": "another_track_id", "reason": "selection reasoning"}}
  ]
}}

Focus on:
1. Time-appropriate energy levels
2. Mood matching for current time of day
3. User's genre preferences
4. Variety while maintaining cohesion"#,
        time_of_day = text(time.time_of_day.as_ref()),
        hour = text(time.hour.as_ref()),
        day = text(time.day.as_ref()),
        mood = text(time.mood.as_ref()),
        energy = text(time.energy.as_ref()),
        likes = prefs.likes.len(),
        dislikes = prefs.dislikes.len(),
        genres = top_genre_names(&prefs.genre_scores, PROMPT_GENRE_LIMIT).join(", "),
        available = request.available_tracks.len(),
        kind = text(request.kind.as_ref()),
        length = text(request.requested_length.as_ref()),
    )
}

/// Pulls the widest `{ ... }` span out of free text and parses it.
pub fn extract_json(reply: &str) -> Result<Value, RelayError> {
    let start = reply.find('{').ok_or(RelayError::UnparseableReply)?;
    let end = reply.rfind('}').ok_or(RelayError::UnparseableReply)?;
    if end < start {
        return Err(RelayError::UnparseableReply);
    }

    serde_json::from_str(&reply[start..=end]).map_err(|e| {
        tracing::warn!("model reply was not valid json: {}", e);
        RelayError::UnparseableReply
    })
}

/// Forwards playlist requests to the model endpoint. Holds one shared HTTP
/// client; no state is kept between calls.
#[derive(Clone)]
pub struct PlaylistRelay {
    client: Client,
    config: LlmConfig,
}

impl PlaylistRelay {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// The configured key wins; otherwise the caller's bearer token is used.
    pub fn resolve_key<'a>(&'a self, bearer: Option<&'a str>) -> Result<&'a str, RelayError> {
        self.config
            .api_key
            .as_deref()
            .or(bearer.filter(|k| !k.is_empty()))
            .ok_or(RelayError::MissingApiKey)
    }

    pub async fn generate(
        &self,
        request: &PlaylistRequest,
        bearer: Option<&str>,
    ) -> Result<Value, RelayError> {
        let api_key = self.resolve_key(bearer)?;
        let prompt = build_prompt(request);

        tracing::info!(
            "requesting playlist from {} ({} candidate tracks)",
            self.config.model,
            request.available_tracks.len()
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&MessagesRequest {
                model: &self.config.model,
                max_tokens: self.config.max_tokens,
                messages: [Message {
                    role: "user",
                    content: &prompt,
                }],
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RelayError::Upstream(response.status()));
        }

        let body: MessagesResponse = response.json().await?;
        let reply = body
            .content
            .into_iter()
            .next()
            .and_then(|block| block.text)
            .ok_or(RelayError::UnparseableReply)?;

        extract_json(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

    /// Serves `reply` with `status` on a random local port and records what
    /// the relay sent.
    async fn spawn_model(status: StatusCode, reply: Value) -> (PlaylistRelay, Seen) {
        let seen: Seen = Arc::default();
        let recorder = seen.clone();
        let router = Router::new().route(
            "/v1/messages",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let recorder = recorder.clone();
                let reply = reply.clone();
                async move {
                    recorder.lock().push((headers, body));
                    (status, Json(reply))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let relay = PlaylistRelay::new(LlmConfig {
            api_key: None,
            endpoint: format!("http://{addr}/v1/messages"),
            model: "curator-model".into(),
            max_tokens: 321,
        });
        (relay, seen)
    }

    fn request() -> PlaylistRequest {
        serde_json::from_value(json!({
            "timeContext": {
                "timeOfDay": "evening", "hour": 20, "day": "Friday",
                "mood": "relaxed", "energy": "low"
            },
            "userPreferences": {
                "likes": ["a", "b"],
                "dislikes": ["c"],
                "genreScores": {"pop": 1, "sonati": 9, "rock": 4, "jazz": 2}
            },
            "availableTracks": [
                {"id": 1, "title": "Bahar", "singer": "Homayoun", "genre1": "sonati",
                 "genre2": "folk", "mood1": "calm", "mood2": "warm", "mood3": "deep",
                 "prompt": "slow tar"}
            ],
            "requestedLength": 10,
            "type": "daily"
        }))
        .unwrap()
    }

    #[test]
    fn test_prompt_contains_context() {
        let prompt = build_prompt(&request());

        assert!(prompt.contains("TIME CONTEXT: evening (20:00) on Friday"));
        assert!(prompt.contains("- Liked tracks: 2 songs"));
        assert!(prompt.contains("- Disliked tracks: 1 songs"));
        assert!(prompt.contains("- Top genres: sonati, rock, jazz"));
        assert!(prompt.contains("PLAYLIST TYPE: daily"));
        assert!(prompt.contains("Select 10 tracks"));
        assert!(prompt.contains(
            "ID: 1 | \"Bahar\" by Homayoun | Genres: sonati, folk | Moods: calm, warm, deep | slow tar"
        ));
        assert!(prompt.contains(r#""playlist": ["#));
    }

    #[test]
    fn test_prompt_lists_at_most_fifty_tracks() {
        let mut req = request();
        req.available_tracks = (0..80)
            .map(|i| serde_json::from_value(json!({"id": i, "title": format!("t{i}")})).unwrap())
            .collect();

        let prompt = build_prompt(&req);
        assert!(prompt.contains("AVAILABLE TRACKS: 80 songs"));
        assert_eq!(prompt.matches("\nID: ").count(), 50);
        assert!(!prompt.contains("\"t50\""));
    }

    #[test]
    fn test_extract_json_from_chatter() {
        let reply = "Sure! Here it is:\n{\"title\": \"Night\", \"playlist\": [{\"id\": \"1\"}]}\nEnjoy.";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["title"], "Night");
        assert_eq!(value["playlist"][0]["id"], "1");
    }

    #[test]
    fn test_extract_json_failures() {
        assert!(matches!(
            extract_json("no braces here"),
            Err(RelayError::UnparseableReply)
        ));
        assert!(matches!(
            extract_json("} backwards {"),
            Err(RelayError::UnparseableReply)
        ));
        assert!(matches!(
            extract_json("{ not: json }"),
            Err(RelayError::UnparseableReply)
        ));
    }

    #[test]
    fn test_key_resolution() {
        let mut config = LlmConfig {
            api_key: None,
            endpoint: "http://localhost:1".into(),
            model: "m".into(),
            max_tokens: 10,
        };
        let relay = PlaylistRelay::new(config.clone());
        assert!(matches!(
            relay.resolve_key(None),
            Err(RelayError::MissingApiKey)
        ));
        assert_eq!(relay.resolve_key(Some("from-header")).unwrap(), "from-header");

        config.api_key = Some("server-key".into());
        let relay = PlaylistRelay::new(config);
        assert_eq!(relay.resolve_key(Some("from-header")).unwrap(), "server-key");
    }

    #[tokio::test]
    async fn test_generate_sends_headers_and_parses_reply() {
        let reply = json!({
            "content": [{
                "type": "text",
                "text": "Here you go:\n{\"title\": \"Evening\", \"playlist\": [{\"id\": \"1\", \"reason\": \"calm\"}]}"
            }]
        });
        let (relay, seen) = spawn_model(StatusCode::OK, reply).await;

        let playlist = relay.generate(&request(), Some("caller-key")).await.unwrap();
        assert_eq!(playlist["title"], "Evening");
        assert_eq!(playlist["playlist"][0]["id"], "1");

        let calls = seen.lock();
        assert_eq!(calls.len(), 1);
        let (headers, body) = &calls[0];
        assert_eq!(headers["x-api-key"], "caller-key");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        assert_eq!(body["model"], "curator-model");
        assert_eq!(body["max_tokens"], 321);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("PLAYLIST TYPE: daily"));
    }

    #[tokio::test]
    async fn test_generate_reports_upstream_failure() {
        let (relay, _) = spawn_model(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"type": "overloaded_error"}}),
        )
        .await;

        let err = relay.generate(&request(), Some("k")).await.unwrap_err();
        match err {
            RelayError::Upstream(status) => assert_eq!(status.as_u16(), 500),
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_content() {
        let (relay, _) = spawn_model(StatusCode::OK, json!({"content": []})).await;

        let err = relay.generate(&request(), Some("k")).await.unwrap_err();
        assert!(matches!(err, RelayError::UnparseableReply));
    }
}
