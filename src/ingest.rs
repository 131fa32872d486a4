//! Ingestion transactions.
//!
//! One [`Ingestor`] owns the process-wide write lock. Concurrent iterations
//! (slow and fast polls, different users) are applied strictly one at a
//! time, which is what keeps watermark updates and entity inserts from
//! interleaving.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::spotify::{Album, Artist, Listen, Track};
use crate::store::Store;

pub struct Ingestor {
    store: Arc<Store>,
    write_lock: Mutex<()>,
}

impl Ingestor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Apply one polling iteration's results as a unit.
    ///
    /// Under the write lock: persist the deduplicated entities (duplicate
    /// keys from racing resolvers are ignored), append this user's listens,
    /// advance the last-sync watermark to `iteration_ts`, and pull the
    /// first-listen watermark down to the batch's earliest play. The guard
    /// is scoped, so the lock is released on every exit path.
    pub async fn apply(
        &self,
        user_id: &str,
        iteration_ts: DateTime<Utc>,
        tracks: &[Track],
        albums: &[Album],
        artists: &[Artist],
        listens: &[Listen],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .apply_iteration(user_id, iteration_ts, tracks, albums, artists, listens)
    }
}
