use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::models::Track;

/// Identity key attached to every history entry: `title + "_" + singer`.
///
/// Two different tracks sharing a title and singer collide here, and the
/// track's own `id` is ignored. Callers should only go through this function so
/// the key can be swapped for the real track id in one place.
pub fn legacy_track_id(track: &Track) -> String {
    format!("{}_{}", track.text("title"), track.text("singer"))
}

/// Derives a 16 hex character user id from a client fingerprint. Without a
/// fingerprint the current epoch milliseconds are hashed instead, which yields
/// a fresh id per call.
pub fn user_id_from_fingerprint(fingerprint: Option<&str>) -> String {
    let seed = match fingerprint {
        Some(f) if !f.is_empty() => f.to_string(),
        _ => Utc::now().timestamp_millis().to_string(),
    };

    let digest = Sha256::digest(seed.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_track_id_concatenates_title_and_singer() {
        let track: Track =
            serde_json::from_value(json!({"id": 7, "title": "Gole Sangam", "singer": "Sattar"}))
                .unwrap();
        assert_eq!(legacy_track_id(&track), "Gole Sangam_Sattar");
    }

    #[test]
    fn test_track_id_missing_fields() {
        let track: Track = serde_json::from_value(json!({"title": "Solo"})).unwrap();
        assert_eq!(legacy_track_id(&track), "Solo_undefined");
        assert_eq!(legacy_track_id(&Track::default()), "undefined_undefined");
    }

    #[test]
    fn test_same_title_and_singer_collide() {
        let a: Track =
            serde_json::from_value(json!({"id": "a", "title": "Ey Iran", "singer": "Banan"}))
                .unwrap();
        let b: Track =
            serde_json::from_value(json!({"id": "b", "title": "Ey Iran", "singer": "Banan"}))
                .unwrap();
        assert_eq!(legacy_track_id(&a), legacy_track_id(&b));
    }

    #[test]
    fn test_fingerprint_hash_is_stable() {
        let id = user_id_from_fingerprint(Some("browser-fp"));
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, user_id_from_fingerprint(Some("browser-fp")));
        assert_ne!(id, user_id_from_fingerprint(Some("other-fp")));
    }
}
