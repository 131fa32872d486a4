//! wavelog mirrors a user's streaming listening history into a local
//! SQLite library.
//!
//! The pipeline: a single-lane rate-limited request queue in front of the
//! Spotify API (with transparent token refresh), an entity resolver that
//! fetches only catalog entries the library is missing, and a lock-guarded
//! ingestion transaction that persists entities, listens and per-user sync
//! watermarks.

pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod oauth;
pub mod queue;
pub mod resolver;
pub mod spotify;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::ApiError;
pub use ingest::Ingestor;
pub use queue::RequestQueue;
pub use resolver::resolve_and_fetch;
pub use spotify::SpotifyApi;
pub use store::Store;
pub use sync::SyncRunner;
