//! Pluggable session storage backend.
//!
//! The [`SessionBackend`] trait abstracts over session persistence so that
//! callers can swap in an SQLite store, a custom binary file, an in-memory
//! store, or anything else.
//!
//! Built-in backends:
//! * [`BinaryFileBackend`]: compact binary file (default).
//! * [`InMemoryBackend`]: nothing touches the disk.
//! * [`SqliteBackend`]: SQLite (requires the `sqlite-session` Cargo feature).

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::session::PersistedSession;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how session data is persisted.
pub trait SessionBackend: Send + Sync {
    /// Persist the given session.
    fn save(&self, session: &PersistedSession) -> io::Result<()>;

    /// Load a previously persisted session, or return `None` if none exists.
    fn load(&self) -> io::Result<Option<PersistedSession>>;

    /// Remove the stored session.
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── BinaryFileBackend ────────────────────────────────────────────────────────

/// The default session backend: stores the session in a compact binary file.
///
/// The format is the one produced by [`PersistedSession::to_bytes`].
pub struct BinaryFileBackend {
    path: PathBuf,
}

impl BinaryFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionBackend for BinaryFileBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        session.save(&self.path)
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        PersistedSession::load(&self.path).map(Some)
    }

    fn delete(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryBackend ─────────────────────────────────────────────────────────

/// An ephemeral session backend that stores nothing on disk.
///
/// Useful for tests, or to seed a client with known keys.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Option<PersistedSession>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that already holds `session`.
    pub fn with_session(session: PersistedSession) -> Self {
        Self { data: Mutex::new(Some(session)) }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Option<PersistedSession>>> {
        self.data.lock().map_err(|_| io::Error::other("session store poisoned"))
    }
}

impl SessionBackend for InMemoryBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        *self.lock()? = Some(session.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        Ok(self.lock()?.clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.lock()? = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteBackend ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteBackend;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use crate::session::DcEntry;
    use rusqlite::{Connection, params};

    fn other(e: rusqlite::Error) -> io::Error { io::Error::other(e) }

    /// SQLite-backed session store.
    ///
    /// Creates two tables (`meta` and `dc_entries`) if they do not exist.
    ///
    /// Enable with the `sqlite-session` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// ferry-client = { version = "*", features = ["sqlite-session"] }
    /// ```
    pub struct SqliteBackend {
        path: PathBuf,
    }

    impl SqliteBackend {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Open and initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(other)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS dc_entries (
                    dc_id       INTEGER PRIMARY KEY,
                    addr        TEXT    NOT NULL,
                    auth_key    BLOB,
                    first_salt  INTEGER NOT NULL DEFAULT 0,
                    time_offset INTEGER NOT NULL DEFAULT 0
                );",
            ).map_err(other)?;
            Ok(Self { path })
        }
    }

    impl SessionBackend for SqliteBackend {
        fn save(&self, session: &PersistedSession) -> io::Result<()> {
            let mut conn = Connection::open(&self.path).map_err(other)?;
            let tx = conn.transaction().map_err(other)?;

            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('home_dc_id', ?1)",
                params![session.home_dc_id.to_string()],
            ).map_err(other)?;

            tx.execute("DELETE FROM dc_entries", []).map_err(other)?;
            for dc in &session.dcs {
                let key_blob: Option<Vec<u8>> = dc.auth_key.map(|k| k.to_vec());
                tx.execute(
                    "INSERT INTO dc_entries
                        (dc_id, addr, auth_key, first_salt, time_offset)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![dc.dc_id, dc.addr, key_blob, dc.first_salt, dc.time_offset],
                ).map_err(other)?;
            }
            tx.commit().map_err(other)
        }

        fn load(&self) -> io::Result<Option<PersistedSession>> {
            if !self.path.exists() {
                return Ok(None);
            }
            let conn = Connection::open(&self.path).map_err(other)?;

            let home_dc_id: Option<i32> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'home_dc_id'",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .ok()
                .and_then(|v| v.parse().ok());

            let Some(home_dc_id) = home_dc_id else {
                return Ok(None);
            };

            let mut stmt = conn
                .prepare("SELECT dc_id, addr, auth_key, first_salt, time_offset FROM dc_entries")
                .map_err(other)?;

            let dcs: Vec<DcEntry> = stmt
                .query_map([], |row| {
                    let key_blob: Option<Vec<u8>> = row.get(2)?;
                    Ok(DcEntry {
                        dc_id:       row.get(0)?,
                        addr:        row.get(1)?,
                        auth_key:    key_blob.and_then(|k| <[u8; 256]>::try_from(k.as_slice()).ok()),
                        first_salt:  row.get(3)?,
                        time_offset: row.get(4)?,
                    })
                })
                .map_err(other)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(Some(PersistedSession { home_dc_id, dcs }))
        }

        fn delete(&self) -> io::Result<()> {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}
