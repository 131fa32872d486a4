//! Ingestion counters.
//!
//! Fire-and-forget: incrementing never fails and nothing in the pipeline
//! waits on the metrics system. The registry is exported so a scrape
//! endpoint can be bolted on by whatever embeds the library.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts, Registry};

const PREFIX: &str = "wavelog";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref INGESTED_TRACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_ingested_tracks_total"),
            "Tracks fetched and stored during ingestion"
        ),
        &["user"]
    )
    .expect("Failed to create ingested_tracks_total metric");

    pub static ref INGESTED_ALBUMS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_ingested_albums_total"),
            "Albums fetched and stored during ingestion"
        ),
        &["user"]
    )
    .expect("Failed to create ingested_albums_total metric");

    pub static ref INGESTED_ARTISTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_ingested_artists_total"),
            "Artists fetched and stored during ingestion"
        ),
        &["user"]
    )
    .expect("Failed to create ingested_artists_total metric");

    pub static ref TOKEN_REFRESHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_token_refreshes_total"),
            "Access-token refreshes performed by the gateway"
        ),
        &["user"]
    )
    .expect("Failed to create token_refreshes_total metric");

    pub static ref SYNC_ITERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            format!("{PREFIX}_sync_iterations_total"),
            "Completed sync iterations by outcome"
        ),
        &["user", "status"]
    )
    .expect("Failed to create sync_iterations_total metric");
}

/// Register all counters. Ignores double-registration so tests can call it
/// repeatedly.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(INGESTED_TRACKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(INGESTED_ALBUMS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(INGESTED_ARTISTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TOKEN_REFRESHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_ITERATIONS_TOTAL.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        init_metrics();
        let before = INGESTED_TRACKS_TOTAL.with_label_values(&["u1"]).get();
        INGESTED_TRACKS_TOTAL.with_label_values(&["u1"]).inc_by(3);
        let after = INGESTED_TRACKS_TOTAL.with_label_values(&["u1"]).get();
        assert_eq!(after - before, 3);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        SYNC_ITERATIONS_TOTAL
            .with_label_values(&["u1", "ok"])
            .inc();
    }
}
