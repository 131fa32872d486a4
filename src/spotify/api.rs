//! Per-user Spotify API handle.
//!
//! Every operation is submitted to the shared [`RequestQueue`] and begins by
//! validating the user's credentials ([`SpotifyApi::check_token`]), so a
//! request never fires with a token known to be expired. Because the queue
//! serializes globally, the check-then-use sequence cannot race a concurrent
//! refresh for the same user.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SpotifyConfig;
use crate::error::ApiError;
use crate::metrics;
use crate::oauth::{http_client, TokenProvider};
use crate::queue::RequestQueue;
use crate::spotify::{
    CatalogSource, PlayedItem, SpotifyAlbum, SpotifyArtist, SpotifyMe, SpotifyPlaylist,
    SpotifyTrack,
};
use crate::store::{Store, User};

/// Track ids accepted per playlist-write call.
pub const CHUNK_SIZE: usize = 100;
/// Pause between successive chunks of one playlist write.
const CHUNK_PAUSE: Duration = Duration::from_millis(1000);
/// Refresh this long before expiry to absorb clock skew and in-flight latency.
const EXPIRY_MARGIN_SECS: i64 = 120;

#[derive(Clone)]
pub struct SpotifyApi {
    user_id: String,
    queue: RequestQueue,
    store: Arc<Store>,
    oauth: Arc<dyn TokenProvider>,
    api_base: String,
    timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct PlaylistPage {
    #[serde(default)]
    items: Vec<SpotifyPlaylist>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedPage {
    #[serde(default)]
    items: Vec<PlayedItem>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: SearchTracks,
}

#[derive(Debug, Deserialize)]
struct SearchTracks {
    #[serde(default)]
    items: Vec<SpotifyTrack>,
}

impl SpotifyApi {
    pub fn new(
        user_id: impl Into<String>,
        queue: RequestQueue,
        store: Arc<Store>,
        oauth: Arc<dyn TokenProvider>,
        config: &SpotifyConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            queue,
            store,
            oauth,
            api_base: config.api_base.clone(),
            timeout: config.request_timeout(),
        }
    }

    /// Validate credentials and build the request client for one operation.
    ///
    /// Refreshes the access token when it is within two minutes of expiry
    /// (or the expiry is unknown) and a refresh token exists; the refreshed
    /// credentials are persisted before any request uses them. Without a
    /// refresh token the stale token is left in place; the request will
    /// fail downstream if the service rejects it.
    async fn check_token(&self) -> Result<Client> {
        let user = self
            .store
            .get_user(&self.user_id)?
            .ok_or_else(|| ApiError::UserNotFound(self.user_id.clone()))?;
        if user.spotify_id.is_none() {
            return Err(ApiError::NoLinkedAccount(self.user_id.clone()).into());
        }

        let mut access = user.access_token.clone();
        if token_expiring(&user) {
            if let Some(refresh_token) = user.refresh_token.as_deref() {
                let token = self.oauth.refresh(refresh_token).await?;
                let expires_at = Utc::now() + TimeDelta::seconds(token.expires_in);
                self.store.update_tokens(
                    &user.id,
                    &token.access_token,
                    token.refresh_token.as_deref(),
                    expires_at,
                )?;
                tracing::info!("Refreshed token for {}", user.username);
                metrics::TOKEN_REFRESHES_TOTAL
                    .with_label_values(&[self.user_id.as_str()])
                    .inc();
                access = Some(token.access_token);
            }
        }

        let access = access.ok_or_else(|| ApiError::NoAccessToken(self.user_id.clone()))?;
        http_client(&access, self.timeout)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.api_base, path)
        }
    }

    // ── Raw verbs ────────────────────────────────────────────────────

    pub async fn get(&self, path: &str) -> Result<Value> {
        let api = self.clone();
        let url = self.url(path);
        self.queue
            .run(async move {
                let client = api.check_token().await?;
                let resp = client.get(&url).send().await.context("Request failed")?;
                anyhow::Ok(resp.error_for_status()?.json::<Value>().await?)
            })
            .await?
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<()> {
        let api = self.clone();
        let url = self.url(path);
        self.queue
            .run(async move {
                let client = api.check_token().await?;
                let resp = client
                    .put(&url)
                    .json(&body)
                    .send()
                    .await
                    .context("Request failed")?;
                resp.error_for_status()?;
                anyhow::Ok(())
            })
            .await?
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let api = self.clone();
        let url = self.url(path);
        self.queue
            .run(async move {
                let client = api.check_token().await?;
                let resp = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .context("Request failed")?;
                anyhow::Ok(resp.error_for_status()?.json::<Value>().await?)
            })
            .await?
    }

    // ── Profile ──────────────────────────────────────────────────────

    pub async fn me(&self) -> Result<SpotifyMe> {
        let value = self.get("/me").await?;
        serde_json::from_value(value).context("Failed to parse profile")
    }

    // ── Per-entity fetches (best-effort) ─────────────────────────────

    pub async fn get_track(&self, id: &str) -> Option<SpotifyTrack> {
        self.fetch_item(&format!("/tracks/{id}"), "track").await
    }

    pub async fn get_album(&self, id: &str) -> Option<SpotifyAlbum> {
        self.fetch_item(&format!("/albums/{id}"), "album").await
    }

    pub async fn get_artist(&self, id: &str) -> Option<SpotifyArtist> {
        self.fetch_item(&format!("/artists/{id}"), "artist").await
    }

    /// Fetch a single catalog item, swallowing failures.
    ///
    /// An item the service can no longer serve (or a transient error on one
    /// item) must not abort a batch fetch of many items, so everything maps
    /// to `None` here.
    async fn fetch_item<T>(&self, path: &str, kind: &str) -> Option<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let api = self.clone();
        let url = self.url(path);
        let display_url = url.clone();
        let result = self
            .queue
            .run(async move {
                let client = api.check_token().await?;
                let resp = client.get(&url).send().await.context("Request failed")?;
                anyhow::Ok(resp.error_for_status()?.json::<T>().await?)
            })
            .await
            .and_then(|inner| inner);

        match result {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Dropping {kind} from batch ({display_url}): {e:#}");
                None
            }
        }
    }

    /// Sequential best-effort fetch; absent entries mark items the upstream
    /// could not serve, and callers filter them out.
    pub async fn get_tracks(&self, ids: &[String]) -> Vec<Option<SpotifyTrack>> {
        let mut tracks = Vec::with_capacity(ids.len());
        for id in ids {
            tracks.push(self.get_track(id).await);
        }
        tracks
    }

    pub async fn get_albums(&self, ids: &[String]) -> Vec<Option<SpotifyAlbum>> {
        let mut albums = Vec::with_capacity(ids.len());
        for id in ids {
            albums.push(self.get_album(id).await);
        }
        albums
    }

    pub async fn get_artists(&self, ids: &[String]) -> Vec<Option<SpotifyArtist>> {
        let mut artists = Vec::with_capacity(ids.len());
        for id in ids {
            artists.push(self.get_artist(id).await);
        }
        artists
    }

    // ── Search ───────────────────────────────────────────────────────

    /// Best-match track search. A genuine 404 is an absent result; any
    /// other failure propagates.
    pub async fn search(&self, track: &str, artist: &str) -> Result<Option<SpotifyTrack>> {
        let track: String = track.chars().take(100).collect();
        let artist: String = artist.chars().take(100).collect();
        let url = self.url(&format!(
            "/search?q=track:{}+artist:{}&type=track&limit=10",
            urlencoding::encode(&track),
            urlencoding::encode(&artist)
        ));

        let api = self.clone();
        self.queue
            .run(async move {
                let client = api.check_token().await?;
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .context("Search request failed")?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !resp.status().is_success() {
                    return Err(ApiError::SearchFailed(resp.status().as_u16()).into());
                }
                let page: SearchResponse = resp.json().await.context("Failed to parse search")?;
                Ok(page.tracks.items.into_iter().next())
            })
            .await?
    }

    // ── Playlists ────────────────────────────────────────────────────

    /// All playlists of the user, following the next-cursor link until the
    /// service reports no further page. Every page fetch is its own queued
    /// operation, so other operations can interleave between pages.
    pub async fn playlists(&self) -> Result<Vec<SpotifyPlaylist>> {
        let mut items = Vec::new();
        let mut next = Some(self.url("/me/playlists?limit=50"));

        while let Some(page_url) = next {
            let api = self.clone();
            let page: PlaylistPage = self
                .queue
                .run(async move {
                    let client = api.check_token().await?;
                    let resp = client
                        .get(&page_url)
                        .send()
                        .await
                        .context("Playlist page request failed")?;
                    anyhow::Ok(resp.error_for_status()?.json::<PlaylistPage>().await?)
                })
                .await??;
            items.extend(page.items);
            next = page.next;
        }
        Ok(items)
    }

    /// Create a playlist and fill it with the given tracks. Returns the new
    /// playlist id.
    pub async fn create_playlist(&self, name: &str, ids: &[String]) -> Result<String> {
        let api = self.clone();
        let name = name.to_string();
        let ids = ids.to_vec();
        self.queue
            .run(async move {
                let client = api.check_token().await?;
                let resp = client
                    .post(api.url("/me/playlists"))
                    .json(&json!({
                        "name": name,
                        "public": true,
                        "collaborative": false,
                        "description": "",
                    }))
                    .send()
                    .await
                    .context("Create playlist request failed")?;
                let created: SpotifyPlaylist = resp.error_for_status()?.json().await?;
                let endpoint = api.url(&format!("/playlists/{}/tracks", created.id));
                add_chunked(&client, &endpoint, &ids).await?;
                anyhow::Ok(created.id)
            })
            .await?
    }

    pub async fn add_to_playlist(&self, playlist_id: &str, ids: &[String]) -> Result<()> {
        let api = self.clone();
        let ids = ids.to_vec();
        let endpoint = self.url(&format!("/playlists/{playlist_id}/tracks"));
        self.queue
            .run(async move {
                let client = api.check_token().await?;
                add_chunked(&client, &endpoint, &ids).await
            })
            .await?
    }

    // ── Playback ─────────────────────────────────────────────────────

    pub async fn play_track(&self, track_uri: &str) -> Result<()> {
        self.put("/me/player/play", json!({ "uris": [track_uri] }))
            .await
    }

    // ── Listen feed ──────────────────────────────────────────────────

    /// Played items after the given instant (exclusive), oldest data the
    /// service still has first-served. Errors propagate: the sync loop
    /// abandons the iteration and retries next poll.
    pub async fn recently_played(
        &self,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<PlayedItem>> {
        let mut path = format!("/me/player/recently-played?limit={limit}");
        if let Some(after) = after {
            path.push_str(&format!("&after={}", after.timestamp_millis()));
        }
        let value = self.get(&path).await?;
        let page: RecentlyPlayedPage =
            serde_json::from_value(value).context("Failed to parse recently-played feed")?;
        Ok(page.items)
    }
}

#[async_trait]
impl CatalogSource for SpotifyApi {
    async fn track(&self, id: &str) -> Option<SpotifyTrack> {
        self.get_track(id).await
    }

    async fn album(&self, id: &str) -> Option<SpotifyAlbum> {
        self.get_album(id).await
    }

    async fn artist(&self, id: &str) -> Option<SpotifyArtist> {
        self.get_artist(id).await
    }
}

fn token_expiring(user: &User) -> bool {
    match user.expires_at {
        Some(expires_at) => Utc::now() > expires_at - TimeDelta::seconds(EXPIRY_MARGIN_SECS),
        // No recorded expiry: assume the worst and refresh if possible.
        None => true,
    }
}

/// Build the per-chunk uri payloads for a playlist write, preserving order.
fn chunk_uris(ids: &[String]) -> Vec<Vec<String>> {
    ids.chunks(CHUNK_SIZE)
        .map(|chunk| {
            chunk
                .iter()
                .map(|id| format!("spotify:track:{id}"))
                .collect()
        })
        .collect()
}

/// Write track ids to a playlist endpoint in paced chunks.
///
/// Runs inside an operation that already holds the queue slot, so the pacing
/// sleep happens while the lane is held; re-enqueuing from here would wait
/// on itself forever, and releasing the lane mid-write would let another
/// operation observe a half-filled playlist.
async fn add_chunked(client: &Client, endpoint: &str, ids: &[String]) -> Result<()> {
    let payloads = chunk_uris(ids);
    let total = payloads.len();
    for (i, uris) in payloads.into_iter().enumerate() {
        client
            .post(endpoint)
            .json(&json!({ "uris": uris }))
            .send()
            .await
            .context("Playlist write failed")?
            .error_for_status()?;
        if i != total - 1 {
            tokio::time::sleep(CHUNK_PAUSE).await;
        }
    }
    Ok(())
}
