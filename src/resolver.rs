//! Entity resolution.
//!
//! Given the track ids of a batch of plays, work out the minimal set of new
//! track/album/artist records that must be fetched and stored, reusing
//! whatever the library already has. Fetches are best-effort per item: a
//! track the upstream can no longer serve is dropped from the batch, not an
//! error.

use std::collections::HashSet;

use anyhow::Result;

use crate::metrics;
use crate::spotify::{Album, Artist, CatalogSource, ResolvedBatch, Track};
use crate::store::Store;

/// Resolve a batch of played-track ids into the entities missing from the
/// library, normalized and deduplicated, ready for ingestion.
///
/// Ids already present in the store cost nothing: a fully-cached input
/// returns an all-empty batch without touching the network.
pub async fn resolve_and_fetch(
    store: &Store,
    source: &dyn CatalogSource,
    user_id: &str,
    played_track_ids: &[String],
) -> Result<ResolvedBatch> {
    let ids = unique(played_track_ids.iter().cloned());

    let stored: HashSet<String> = store
        .find_tracks(&ids)?
        .into_iter()
        .map(|t| t.id)
        .collect();
    let missing: Vec<String> = ids.into_iter().filter(|id| !stored.contains(id)).collect();

    if missing.is_empty() {
        tracing::info!("No missing tracks, passing");
        return Ok(ResolvedBatch::default());
    }

    // Fetch the unknown tracks; absent results are silently dropped.
    let mut tracks: Vec<Track> = Vec::with_capacity(missing.len());
    for id in &missing {
        if let Some(fetched) = source.track(id).await {
            tracing::info!(
                "Storing non existing track {} by {}",
                fetched.name,
                fetched
                    .artists
                    .first()
                    .map(|a| a.name.as_str())
                    .unwrap_or("unknown")
            );
            tracks.push(Track::from(fetched));
        }
    }
    metrics::INGESTED_TRACKS_TOTAL
        .with_label_values(&[user_id])
        .inc_by(tracks.len() as u64);

    // Referenced albums/artists come from the newly fetched tracks only;
    // anything referenced by an already-stored track is already resolved.
    let related_albums = unique(tracks.iter().map(|t| t.album.clone()));
    let related_artists = unique(tracks.iter().flat_map(|t| t.artists.iter().cloned()));

    let stored_albums: HashSet<String> = store
        .find_albums(&related_albums)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let missing_albums: Vec<String> = related_albums
        .into_iter()
        .filter(|id| !stored_albums.contains(id))
        .collect();

    let stored_artists: HashSet<String> = store
        .find_artists(&related_artists)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let missing_artists: Vec<String> = related_artists
        .into_iter()
        .filter(|id| !stored_artists.contains(id))
        .collect();

    let mut albums: Vec<Album> = Vec::with_capacity(missing_albums.len());
    for id in &missing_albums {
        if let Some(fetched) = source.album(id).await {
            tracing::info!(
                "Storing non existing album {} by {}",
                fetched.name,
                fetched
                    .artists
                    .first()
                    .map(|a| a.name.as_str())
                    .unwrap_or("unknown")
            );
            albums.push(Album::from(fetched));
        }
    }
    metrics::INGESTED_ALBUMS_TOTAL
        .with_label_values(&[user_id])
        .inc_by(albums.len() as u64);

    let mut artists: Vec<Artist> = Vec::with_capacity(missing_artists.len());
    for id in &missing_artists {
        if let Some(fetched) = source.artist(id).await {
            tracing::info!("Storing non existing artist {}", fetched.name);
            artists.push(Artist::from(fetched));
        }
    }
    metrics::INGESTED_ARTISTS_TOTAL
        .with_label_values(&[user_id])
        .inc_by(artists.len() as u64);

    // A batch may reach the same entity through several tracks; persist
    // each id at most once.
    Ok(ResolvedBatch {
        tracks: dedup_by_id(tracks, |t| &t.id),
        albums: dedup_by_id(albums, |a| &a.id),
        artists: dedup_by_id(artists, |a| &a.id),
    })
}

/// Deduplicate preserving first-seen order.
fn unique(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}

fn dedup_by_id<T, F>(items: Vec<T>, id: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(id(item).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spotify::{ArtistRef, SpotifyAlbum, SpotifyArtist, SpotifyTrack};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory catalog that counts every fetch.
    #[derive(Default)]
    struct StubCatalog {
        tracks: HashMap<String, SpotifyTrack>,
        albums: HashMap<String, SpotifyAlbum>,
        artists: HashMap<String, SpotifyArtist>,
        calls: AtomicUsize,
    }

    impl StubCatalog {
        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn with_track(mut self, id: &str, album: &str, artists: &[&str]) -> Self {
            self.tracks.insert(id.to_string(), wire_track(id, album, artists));
            self
        }

        fn with_album(mut self, id: &str, artists: &[&str]) -> Self {
            self.albums.insert(id.to_string(), wire_album(id, artists));
            self
        }

        fn with_artist(mut self, id: &str) -> Self {
            self.artists.insert(
                id.to_string(),
                SpotifyArtist {
                    id: id.to_string(),
                    name: format!("Artist {id}"),
                    genres: vec![],
                    images: vec![],
                },
            );
            self
        }
    }

    #[async_trait]
    impl CatalogSource for StubCatalog {
        async fn track(&self, id: &str) -> Option<SpotifyTrack> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tracks.get(id).cloned()
        }

        async fn album(&self, id: &str) -> Option<SpotifyAlbum> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.albums.get(id).cloned()
        }

        async fn artist(&self, id: &str) -> Option<SpotifyArtist> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.artists.get(id).cloned()
        }
    }

    fn wire_track(id: &str, album: &str, artists: &[&str]) -> SpotifyTrack {
        SpotifyTrack {
            id: id.to_string(),
            name: format!("Track {id}"),
            album: wire_album(album, artists),
            artists: artists
                .iter()
                .map(|a| ArtistRef {
                    id: a.to_string(),
                    name: format!("Artist {a}"),
                })
                .collect(),
            duration_ms: 180_000,
            popularity: 10,
            uri: format!("spotify:track:{id}"),
        }
    }

    fn wire_album(id: &str, artists: &[&str]) -> SpotifyAlbum {
        SpotifyAlbum {
            id: id.to_string(),
            name: format!("Album {id}"),
            album_type: "album".to_string(),
            artists: artists
                .iter()
                .map(|a| ArtistRef {
                    id: a.to_string(),
                    name: format!("Artist {a}"),
                })
                .collect(),
            release_date: String::new(),
            release_date_precision: String::new(),
            genres: vec![],
            images: vec![],
        }
    }

    fn stored_track(id: &str, album: &str, artists: &[&str]) -> Track {
        Track::from(wire_track(id, album, artists))
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fully_cached_input_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_tracks(&[stored_track("t1", "a1", &["r1"])])
            .unwrap();
        let catalog = StubCatalog::default();

        let batch = resolve_and_fetch(&store, &catalog, "u1", &ids(&["t1"]))
            .await
            .unwrap();

        assert!(batch.tracks.is_empty());
        assert!(batch.albums.is_empty());
        assert!(batch.artists.is_empty());
        assert_eq!(catalog.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_input_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let catalog = StubCatalog::default();

        let batch = resolve_and_fetch(&store, &catalog, "u1", &[]).await.unwrap();

        assert!(batch.tracks.is_empty());
        assert_eq!(catalog.call_count(), 0);
    }

    #[tokio::test]
    async fn test_only_missing_references_are_fetched() {
        // Store already knows T1 with album A1 and artist R1. T2 is new,
        // lives on the stored album A1 but introduces artist R2.
        let store = Store::open_in_memory().unwrap();
        store
            .insert_tracks(&[stored_track("t1", "a1", &["r1"])])
            .unwrap();
        store
            .insert_albums(&[Album::from(wire_album("a1", &["r1"]))])
            .unwrap();
        store
            .insert_artists(&[Artist {
                id: "r1".to_string(),
                name: "Artist r1".to_string(),
                genres: vec![],
                images: vec![],
            }])
            .unwrap();

        let catalog = StubCatalog::default()
            .with_track("t2", "a1", &["r2"])
            .with_album("a1", &["r1"])
            .with_artist("r2");

        let batch = resolve_and_fetch(&store, &catalog, "u1", &ids(&["t1", "t2"]))
            .await
            .unwrap();

        assert_eq!(batch.tracks.len(), 1);
        assert_eq!(batch.tracks[0].id, "t2");
        assert!(batch.albums.is_empty());
        assert_eq!(batch.artists.len(), 1);
        assert_eq!(batch.artists[0].id, "r2");
        // One track fetch + one artist fetch; the album was cached.
        assert_eq!(catalog.call_count(), 2);
    }

    #[tokio::test]
    async fn test_shared_album_appears_once() {
        let store = Store::open_in_memory().unwrap();
        let catalog = StubCatalog::default()
            .with_track("t1", "a1", &["r1"])
            .with_track("t2", "a1", &["r1"])
            .with_album("a1", &["r1"])
            .with_artist("r1");

        let batch = resolve_and_fetch(&store, &catalog, "u1", &ids(&["t1", "t2"]))
            .await
            .unwrap();

        assert_eq!(batch.tracks.len(), 2);
        assert_eq!(batch.albums.len(), 1);
        assert_eq!(batch.albums[0].id, "a1");
        assert_eq!(batch.artists.len(), 1);
    }

    #[tokio::test]
    async fn test_unfetchable_track_is_dropped_not_fatal() {
        let store = Store::open_in_memory().unwrap();
        // t2 is unknown upstream as well: the catalog has only t1.
        let catalog = StubCatalog::default()
            .with_track("t1", "a1", &["r1"])
            .with_album("a1", &["r1"])
            .with_artist("r1");

        let batch = resolve_and_fetch(&store, &catalog, "u1", &ids(&["t1", "t2"]))
            .await
            .unwrap();

        assert_eq!(batch.tracks.len(), 1);
        assert_eq!(batch.tracks[0].id, "t1");
        // t2's references never enter the album/artist gap computation.
        assert_eq!(batch.albums.len(), 1);
        assert_eq!(batch.artists.len(), 1);
    }

    #[tokio::test]
    async fn test_normalization_replaces_embeds_with_ids() {
        let store = Store::open_in_memory().unwrap();
        let catalog = StubCatalog::default()
            .with_track("t1", "a1", &["r1", "r2"])
            .with_album("a1", &["r1"])
            .with_artist("r1")
            .with_artist("r2");

        let batch = resolve_and_fetch(&store, &catalog, "u1", &ids(&["t1"]))
            .await
            .unwrap();

        assert_eq!(batch.tracks[0].album, "a1");
        assert_eq!(batch.tracks[0].artists, ids(&["r1", "r2"]));
        assert_eq!(batch.albums[0].artists, ids(&["r1"]));
    }

    #[tokio::test]
    async fn test_duplicate_input_ids_fetch_once() {
        let store = Store::open_in_memory().unwrap();
        let catalog = StubCatalog::default()
            .with_track("t1", "a1", &["r1"])
            .with_album("a1", &["r1"])
            .with_artist("r1");

        let batch = resolve_and_fetch(&store, &catalog, "u1", &ids(&["t1", "t1", "t1"]))
            .await
            .unwrap();

        assert_eq!(batch.tracks.len(), 1);
        // 1 track + 1 album + 1 artist fetch, not three track fetches.
        assert_eq!(catalog.call_count(), 3);
    }
}
