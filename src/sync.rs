//! Background listen-history sync.
//!
//! One iteration per linked user per poll: fetch the recently-played feed
//! after the user's last-sync watermark, resolve the unknown entities, and
//! apply everything in a single ingestion transaction. A failed iteration
//! is logged and abandoned; the next poll retries from the last successfully
//! advanced watermark.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::{SpotifyConfig, SyncConfig};
use crate::ingest::Ingestor;
use crate::metrics;
use crate::oauth::TokenProvider;
use crate::queue::RequestQueue;
use crate::resolver::resolve_and_fetch;
use crate::spotify::{Listen, PlayedItem, SpotifyApi};
use crate::store::{Store, User};

pub struct SyncRunner {
    store: Arc<Store>,
    queue: RequestQueue,
    oauth: Arc<dyn TokenProvider>,
    ingestor: Ingestor,
    spotify: SpotifyConfig,
    poll_interval: Duration,
    batch_limit: usize,
}

impl SyncRunner {
    pub fn new(
        store: Arc<Store>,
        queue: RequestQueue,
        oauth: Arc<dyn TokenProvider>,
        spotify: SpotifyConfig,
        sync: &SyncConfig,
    ) -> Self {
        Self {
            ingestor: Ingestor::new(store.clone()),
            store,
            queue,
            oauth,
            spotify,
            poll_interval: Duration::from_secs(sync.poll_interval_secs),
            batch_limit: sync.batch_limit,
        }
    }

    /// Poll forever. Never returns under normal operation.
    pub async fn run(&self) {
        loop {
            self.sync_all().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One pass over every linked user.
    pub async fn sync_all(&self) {
        let users = match self.store.linked_users() {
            Ok(users) => users,
            Err(e) => {
                tracing::error!("Could not list linked users: {e:#}");
                return;
            }
        };

        for user in users {
            match self.sync_user(&user).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!("Synced {count} plays for {}", user.username);
                    }
                    metrics::SYNC_ITERATIONS_TOTAL
                        .with_label_values(&[user.id.as_str(), "ok"])
                        .inc();
                }
                Err(e) => {
                    tracing::error!("Sync failed for {}: {e:#}", user.username);
                    metrics::SYNC_ITERATIONS_TOTAL
                        .with_label_values(&[user.id.as_str(), "error"])
                        .inc();
                }
            }
        }
    }

    /// Run one iteration for a user. Returns the number of plays ingested.
    pub async fn sync_user(&self, user: &User) -> Result<usize> {
        let api = SpotifyApi::new(
            user.id.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.oauth.clone(),
            &self.spotify,
        );

        let iteration_ts = Utc::now();
        let played = api
            .recently_played(user.last_sync_at, self.batch_limit)
            .await
            .context("Could not fetch recently played")?;

        let track_ids: Vec<String> = played.iter().map(|p| p.track.id.clone()).collect();
        let batch = resolve_and_fetch(&self.store, &api, &user.id, &track_ids).await?;
        let listens = listens_from(&played);

        // Applied even when empty: the last-sync watermark advances exactly
        // once per iteration.
        self.ingestor
            .apply(
                &user.id,
                iteration_ts,
                &batch.tracks,
                &batch.albums,
                &batch.artists,
                &listens,
            )
            .await?;

        Ok(listens.len())
    }
}

fn listens_from(played: &[PlayedItem]) -> Vec<Listen> {
    played
        .iter()
        .map(|item| Listen {
            track_id: item.track.id.clone(),
            played_at: item.played_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spotify::{ArtistRef, SpotifyAlbum, SpotifyTrack};
    use chrono::TimeZone;

    fn played(id: &str, at_ms: i64) -> PlayedItem {
        PlayedItem {
            track: SpotifyTrack {
                id: id.to_string(),
                name: format!("Track {id}"),
                album: SpotifyAlbum {
                    id: "a1".to_string(),
                    name: "Album".to_string(),
                    album_type: String::new(),
                    artists: vec![],
                    release_date: String::new(),
                    release_date_precision: String::new(),
                    genres: vec![],
                    images: vec![],
                },
                artists: vec![ArtistRef {
                    id: "r1".to_string(),
                    name: "Artist".to_string(),
                }],
                duration_ms: 1,
                popularity: 0,
                uri: String::new(),
            },
            played_at: Utc.timestamp_millis_opt(at_ms).unwrap(),
        }
    }

    #[test]
    fn test_listens_carry_track_and_timestamp() {
        let listens = listens_from(&[played("t1", 1_000), played("t2", 2_000)]);

        assert_eq!(listens.len(), 2);
        assert_eq!(listens[0].track_id, "t1");
        assert_eq!(listens[0].played_at.timestamp_millis(), 1_000);
        assert_eq!(listens[1].track_id, "t2");
    }

    #[test]
    fn test_replays_of_one_track_stay_distinct() {
        let listens = listens_from(&[played("t1", 1_000), played("t1", 5_000)]);
        assert_eq!(listens.len(), 2);
        assert_ne!(listens[0], listens[1]);
    }
}
