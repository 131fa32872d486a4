pub mod api;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use api::SpotifyApi;

/// Image attached to an album or artist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

/// Artist stub embedded in track and album payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistRef {
    pub id: String,
    pub name: String,
}

// Wire models, exactly as the API returns them. A track embeds its full
// album object and artist objects; normalization replaces those with ids
// before anything reaches the store.

#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyTrack {
    pub id: String,
    pub name: String,
    pub album: SpotifyAlbum,
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub duration_ms: u32,
    #[serde(default)]
    pub popularity: u32,
    #[serde(default)]
    pub uri: String,
}

/// Album payload. Embedded (simplified) album objects omit genres and
/// copyright data; the defaults cover both shapes with one type.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyAlbum {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub album_type: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub release_date_precision: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyArtist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// Entry of the recently-played feed.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayedItem {
    pub track: SpotifyTrack,
    pub played_at: DateTime<Utc>,
}

/// Authenticated profile, used when linking an account.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyMe {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyPlaylist {
    pub id: String,
    pub name: String,
}

// Normalized models as persisted in the library. References are by id only;
// the referenced entities either already exist in the store or ride along in
// the same ingestion batch.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    /// Album id (the embedded album object is stored separately).
    pub album: String,
    /// Artist ids, in credited order.
    pub artists: Vec<String>,
    pub duration_ms: u32,
    pub popularity: u32,
    pub uri: String,
}

impl From<SpotifyTrack> for Track {
    fn from(track: SpotifyTrack) -> Self {
        Self {
            id: track.id,
            name: track.name,
            album: track.album.id,
            artists: track.artists.into_iter().map(|a| a.id).collect(),
            duration_ms: track.duration_ms,
            popularity: track.popularity,
            uri: track.uri,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album_type: String,
    pub release_date: String,
    pub release_date_precision: String,
    pub genres: Vec<String>,
    pub images: Vec<Image>,
}

impl From<SpotifyAlbum> for Album {
    fn from(album: SpotifyAlbum) -> Self {
        Self {
            id: album.id,
            name: album.name,
            artists: album.artists.into_iter().map(|a| a.id).collect(),
            album_type: album.album_type,
            release_date: album.release_date,
            release_date_precision: album.release_date_precision,
            genres: album.genres,
            images: album.images,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub images: Vec<Image>,
}

impl From<SpotifyArtist> for Artist {
    fn from(artist: SpotifyArtist) -> Self {
        Self {
            id: artist.id,
            name: artist.name,
            genres: artist.genres,
            images: artist.images,
        }
    }
}

/// One play of a track by a user. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listen {
    pub track_id: String,
    pub played_at: DateTime<Utc>,
}

/// Entities a resolution pass decided are new, normalized and deduplicated,
/// ready for a single ingestion transaction.
#[derive(Debug, Clone, Default)]
pub struct ResolvedBatch {
    pub tracks: Vec<Track>,
    pub albums: Vec<Album>,
    pub artists: Vec<Artist>,
}

/// Per-entity catalog lookups with best-effort semantics.
///
/// A missing or failed single item comes back as `None`; it must never abort
/// a batch fetch of many items. [`api::SpotifyApi`] is the real
/// implementation, tests substitute stubs.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn track(&self, id: &str) -> Option<SpotifyTrack>;
    async fn album(&self, id: &str) -> Option<SpotifyAlbum>;
    async fn artist(&self, id: &str) -> Option<SpotifyArtist>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_track_json() -> &'static str {
        r#"{
            "id": "t1",
            "name": "Paranoid Android",
            "duration_ms": 387000,
            "popularity": 77,
            "uri": "spotify:track:t1",
            "album": {
                "id": "a1",
                "name": "OK Computer",
                "album_type": "album",
                "release_date": "1997-05-21",
                "release_date_precision": "day",
                "artists": [{"id": "r1", "name": "Radiohead"}],
                "images": [{"url": "https://i.scdn.co/image/x", "height": 640, "width": 640}]
            },
            "artists": [{"id": "r1", "name": "Radiohead"}]
        }"#
    }

    #[test]
    fn test_track_normalization_replaces_embeds_with_ids() {
        let wire: SpotifyTrack = serde_json::from_str(sample_track_json()).unwrap();
        let track = Track::from(wire);

        assert_eq!(track.id, "t1");
        assert_eq!(track.album, "a1");
        assert_eq!(track.artists, vec!["r1".to_string()]);
        assert_eq!(track.duration_ms, 387000);
    }

    #[test]
    fn test_album_normalization_keeps_artist_ids() {
        let json = r#"{
            "id": "a1",
            "name": "OK Computer",
            "album_type": "album",
            "genres": ["alternative rock"],
            "artists": [{"id": "r1", "name": "Radiohead"}]
        }"#;
        let wire: SpotifyAlbum = serde_json::from_str(json).unwrap();
        let album = Album::from(wire);

        assert_eq!(album.artists, vec!["r1".to_string()]);
        assert_eq!(album.genres, vec!["alternative rock".to_string()]);
        // Simplified payload omitted these; defaults apply.
        assert!(album.release_date.is_empty());
        assert!(album.images.is_empty());
    }

    #[test]
    fn test_played_item_parses_rfc3339_timestamp() {
        let json = format!(
            r#"{{"track": {}, "played_at": "2024-03-01T10:15:30.000Z"}}"#,
            sample_track_json()
        );
        let item: PlayedItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item.track.id, "t1");
        assert_eq!(item.played_at.timestamp(), 1_709_288_130);
    }
}
