//! Local library database.
//!
//! Tracks, albums and artists are append-only reference data keyed by the
//! external service's id: they are inserted on first encounter across any
//! user and never updated. `INSERT OR IGNORE` makes duplicate-key conflicts
//! a no-op, which is expected when concurrent resolution passes race on the
//! same entity. Listens are idempotent per (user, track, played-at) so an
//! overlapping poll can never double-store a play.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::spotify::{Album, Artist, Image, Listen, Track};

/// A linked account with its credentials and sync watermarks.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub spotify_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Upper watermark: timestamp of the last completed sync iteration.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Lower watermark: earliest played-at ever observed. Only moves back.
    pub first_listen_at: Option<DateTime<Utc>>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open library database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open test database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Recover the guard if another thread panicked while holding it;
        // SQLite's own transactionality keeps the data consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT NOT NULL,
                    spotify_id TEXT,
                    access_token TEXT,
                    refresh_token TEXT,
                    expires_at INTEGER,
                    last_sync_at INTEGER,
                    first_listen_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS tracks (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    album_id TEXT NOT NULL,
                    artist_ids TEXT NOT NULL,
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    popularity INTEGER NOT NULL DEFAULT 0,
                    uri TEXT NOT NULL DEFAULT ''
                );
                CREATE INDEX IF NOT EXISTS idx_tracks_album ON tracks(album_id);

                CREATE TABLE IF NOT EXISTS albums (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    artist_ids TEXT NOT NULL,
                    album_type TEXT NOT NULL DEFAULT '',
                    release_date TEXT NOT NULL DEFAULT '',
                    release_date_precision TEXT NOT NULL DEFAULT '',
                    genres TEXT NOT NULL DEFAULT '[]',
                    images TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS artists (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    genres TEXT NOT NULL DEFAULT '[]',
                    images TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS listens (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    track_id TEXT NOT NULL,
                    played_at INTEGER NOT NULL,
                    UNIQUE(user_id, track_id, played_at)
                );
                CREATE INDEX IF NOT EXISTS idx_listens_user ON listens(user_id, played_at);",
            )
            .context("Failed to initialize database schema")?;
        Ok(())
    }

    // ── Catalog reads ────────────────────────────────────────────────

    pub fn find_tracks(&self, ids: &[String]) -> Result<Vec<Track>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT id, name, album_id, artist_ids, duration_ms, popularity, uri
             FROM tracks WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to fetch tracks")?;

        rows.into_iter()
            .map(|(id, name, album, artist_ids, duration_ms, popularity, uri)| {
                Ok(Track {
                    id,
                    name,
                    album,
                    artists: decode_json(&artist_ids)?,
                    duration_ms,
                    popularity,
                    uri,
                })
            })
            .collect()
    }

    pub fn find_albums(&self, ids: &[String]) -> Result<Vec<Album>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT id, name, artist_ids, album_type, release_date, release_date_precision,
                    genres, images
             FROM albums WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to fetch albums")?;

        rows.into_iter()
            .map(
                |(id, name, artist_ids, album_type, release_date, precision, genres, images)| {
                    Ok(Album {
                        id,
                        name,
                        artists: decode_json(&artist_ids)?,
                        album_type,
                        release_date,
                        release_date_precision: precision,
                        genres: decode_json(&genres)?,
                        images: decode_json::<Vec<Image>>(&images)?,
                    })
                },
            )
            .collect()
    }

    pub fn find_artists(&self, ids: &[String]) -> Result<Vec<Artist>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT id, name, genres, images FROM artists WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to fetch artists")?;

        rows.into_iter()
            .map(|(id, name, genres, images)| {
                Ok(Artist {
                    id,
                    name,
                    genres: decode_json(&genres)?,
                    images: decode_json::<Vec<Image>>(&images)?,
                })
            })
            .collect()
    }

    // ── Catalog writes ───────────────────────────────────────────────

    pub fn insert_tracks(&self, tracks: &[Track]) -> Result<()> {
        insert_tracks_on(&self.conn(), tracks)
    }

    pub fn insert_albums(&self, albums: &[Album]) -> Result<()> {
        insert_albums_on(&self.conn(), albums)
    }

    pub fn insert_artists(&self, artists: &[Artist]) -> Result<()> {
        insert_artists_on(&self.conn(), artists)
    }

    // ── Users ────────────────────────────────────────────────────────

    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users
                 (id, username, spotify_id, access_token, refresh_token, expires_at,
                  last_sync_at, first_listen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    user.id,
                    user.username,
                    user.spotify_id,
                    user.access_token,
                    user.refresh_token,
                    user.expires_at.map(|t| t.timestamp_millis()),
                    user.last_sync_at.map(|t| t.timestamp_millis()),
                    user.first_listen_at.map(|t| t.timestamp_millis()),
                ],
            )
            .context("Failed to insert user")?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn();
        let user = conn
            .query_row(
                "SELECT id, username, spotify_id, access_token, refresh_token, expires_at,
                        last_sync_at, first_listen_at
                 FROM users WHERE id = ?1",
                [id],
                map_user_row,
            )
            .optional()
            .context("Failed to fetch user")?;
        Ok(user)
    }

    /// Users with a linked external account, in stable order.
    pub fn linked_users(&self) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, username, spotify_id, access_token, refresh_token, expires_at,
                    last_sync_at, first_listen_at
             FROM users WHERE spotify_id IS NOT NULL ORDER BY id",
        )?;
        let users = stmt
            .query_map([], map_user_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to fetch linked users")?;
        Ok(users)
    }

    /// Persist refreshed credentials. A `None` refresh token means the
    /// service did not rotate it, so the stored one is kept.
    pub fn update_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE users
                 SET access_token = ?1,
                     refresh_token = COALESCE(?2, refresh_token),
                     expires_at = ?3
                 WHERE id = ?4",
                params![
                    access_token,
                    refresh_token,
                    expires_at.timestamp_millis(),
                    user_id
                ],
            )
            .context("Failed to store refreshed tokens")?;
        if changed == 0 {
            return Err(anyhow!("user {user_id} not found"));
        }
        Ok(())
    }

    pub fn set_last_sync(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE users SET last_sync_at = ?1 WHERE id = ?2",
            params![at.timestamp_millis(), user_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("user {user_id} not found"));
        }
        Ok(())
    }

    /// Move the first-listen watermark down to `at` if it is unset or later.
    /// Never moves it forward.
    pub fn set_first_listen_if_less(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET first_listen_at = ?1
             WHERE id = ?2 AND (first_listen_at IS NULL OR first_listen_at > ?1)",
            params![at.timestamp_millis(), user_id],
        )?;
        Ok(())
    }

    // ── Listens ──────────────────────────────────────────────────────

    pub fn listens_for_user(&self, user_id: &str) -> Result<Vec<Listen>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT track_id, played_at FROM listens WHERE user_id = ?1 ORDER BY played_at",
        )?;
        let listens = stmt
            .query_map([user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to fetch listens")?;
        Ok(listens
            .into_iter()
            .map(|(track_id, ms)| Listen {
                track_id,
                played_at: DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Apply one polling iteration's results in a single transaction:
    /// entities, listens, then both watermarks. Either everything commits
    /// or nothing does.
    pub fn apply_iteration(
        &self,
        user_id: &str,
        iteration_ts: DateTime<Utc>,
        tracks: &[Track],
        albums: &[Album],
        artists: &[Artist],
        listens: &[Listen],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        insert_tracks_on(&tx, tracks)?;
        insert_albums_on(&tx, albums)?;
        insert_artists_on(&tx, artists)?;

        for listen in listens {
            tx.execute(
                "INSERT OR IGNORE INTO listens (user_id, track_id, played_at)
                 VALUES (?1, ?2, ?3)",
                params![user_id, listen.track_id, listen.played_at.timestamp_millis()],
            )
            .context("Failed to append listen")?;
        }

        // The upper watermark always moves forward: iterations are driven
        // by strictly increasing polling timestamps.
        let changed = tx.execute(
            "UPDATE users SET last_sync_at = ?1 WHERE id = ?2",
            params![iteration_ts.timestamp_millis(), user_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("user {user_id} not found"));
        }

        if let Some(min_played) = listens.iter().map(|l| l.played_at).min() {
            tx.execute(
                "UPDATE users SET first_listen_at = ?1
                 WHERE id = ?2 AND (first_listen_at IS NULL OR first_listen_at > ?1)",
                params![min_played.timestamp_millis(), user_id],
            )?;
        }

        tx.commit().context("Failed to commit iteration")?;
        Ok(())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).context("Corrupt JSON column in library database")
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let to_ts = |ms: Option<i64>| {
        ms.and_then(DateTime::from_timestamp_millis)
    };
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        spotify_id: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: to_ts(row.get(5)?),
        last_sync_at: to_ts(row.get(6)?),
        first_listen_at: to_ts(row.get(7)?),
    })
}

fn insert_tracks_on(conn: &Connection, tracks: &[Track]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO tracks
         (id, name, album_id, artist_ids, duration_ms, popularity, uri)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for track in tracks {
        stmt.execute(params![
            track.id,
            track.name,
            track.album,
            serde_json::to_string(&track.artists)?,
            track.duration_ms,
            track.popularity,
            track.uri,
        ])
        .context("Failed to insert track")?;
    }
    Ok(())
}

fn insert_albums_on(conn: &Connection, albums: &[Album]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO albums
         (id, name, artist_ids, album_type, release_date, release_date_precision, genres, images)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for album in albums {
        stmt.execute(params![
            album.id,
            album.name,
            serde_json::to_string(&album.artists)?,
            album.album_type,
            album.release_date,
            album.release_date_precision,
            serde_json::to_string(&album.genres)?,
            serde_json::to_string(&album.images)?,
        ])
        .context("Failed to insert album")?;
    }
    Ok(())
}

fn insert_artists_on(conn: &Connection, artists: &[Artist]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO artists (id, name, genres, images) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for artist in artists {
        stmt.execute(params![
            artist.id,
            artist.name,
            serde_json::to_string(&artist.genres)?,
            serde_json::to_string(&artist.images)?,
        ])
        .context("Failed to insert artist")?;
    }
    Ok(())
}
