//! Multi-DC connection pool.
//!
//! Keeps the DC address table and one [`Connection`] per DC, spawned the
//! first time a call is routed there. Keys negotiated by the connections are
//! collected back into a [`PersistedSession`] on demand.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionState, Settings, StoredKey};
use crate::errors::InvocationError;
use crate::session::{DcEntry, PersistedSession};
use crate::session_backend::SessionBackend;

// ─── DcPool ───────────────────────────────────────────────────────────────────

/// Pool of per-DC connections.
pub(crate) struct DcPool {
    settings:   Arc<Settings>,
    dcs:        HashMap<i32, DcEntry>,
    conns:      HashMap<i32, Connection>,
    home_dc_id: i32,
    backend:    Arc<dyn SessionBackend>,
    closed:     bool,
}

impl DcPool {
    pub fn new(
        settings:   Arc<Settings>,
        addrs:      HashMap<i32, String>,
        home_dc_id: i32,
        backend:    Arc<dyn SessionBackend>,
    ) -> Self {
        let dcs = addrs
            .into_iter()
            .map(|(id, addr)| (id, DcEntry::new(id, addr)))
            .collect();
        Self { settings, dcs, conns: HashMap::new(), home_dc_id, backend, closed: false }
    }

    /// Merge a loaded session over the address table.
    pub fn restore(&mut self, session: PersistedSession) {
        self.home_dc_id = session.home_dc_id;
        for dc in session.dcs {
            self.dcs.insert(dc.dc_id, dc);
        }
    }

    pub fn home_dc_id(&self) -> i32 { self.home_dc_id }

    pub fn set_home_dc(&mut self, dc_id: i32) {
        if self.home_dc_id != dc_id {
            tracing::info!("[ferry] home DC is now DC{dc_id} (was DC{})", self.home_dc_id);
            self.home_dc_id = dc_id;
        }
    }

    /// The connection for `dc_id`, spawning it if needed.
    ///
    /// The flag is `true` when the connection was created by this call.
    pub fn connection(&mut self, dc_id: i32) -> Result<(Connection, bool), InvocationError> {
        if self.closed {
            return Err(InvocationError::ConnectionClosed);
        }
        if let Some(conn) = self.conns.get(&dc_id) {
            if !conn.is_closed() {
                return Ok((conn.clone(), false));
            }
        }
        let entry = self.dcs.get(&dc_id).ok_or(InvocationError::UnknownDc(dc_id))?;
        let stored = entry.auth_key.map(|auth_key| StoredKey {
            auth_key,
            first_salt:  entry.first_salt,
            time_offset: entry.time_offset,
        });
        tracing::debug!("[ferry] opening DC{dc_id} at {} (stored key: {})", entry.addr, stored.is_some());
        let conn = Connection::spawn(dc_id, entry.addr.clone(), stored, self.settings.clone());
        self.conns.insert(dc_id, conn.clone());
        Ok((conn, true))
    }

    pub fn has_connection(&self, dc_id: i32) -> bool {
        self.conns.get(&dc_id).is_some_and(|c| !c.is_closed())
    }

    pub fn state(&self, dc_id: i32) -> Option<ConnectionState> {
        self.conns.get(&dc_id).map(Connection::state)
    }

    /// Point `dc_id` at a new address. A live connection to the old one is
    /// closed; the next call reconnects.
    pub fn update_addr(&mut self, dc_id: i32, addr: String) {
        let entry = self.dcs.entry(dc_id).or_insert_with(|| DcEntry::new(dc_id, ""));
        if entry.addr == addr {
            return;
        }
        entry.addr = addr;
        if let Some(conn) = self.conns.remove(&dc_id) {
            self.collect(&conn);
            conn.close();
        }
    }

    /// Forget the key for `dc_id` and have its connection negotiate a new one.
    pub fn reset_auth_key(&mut self, dc_id: i32) {
        if let Some(entry) = self.dcs.get_mut(&dc_id) {
            entry.auth_key = None;
            entry.first_salt = 0;
        }
        if let Some(conn) = self.conns.get(&dc_id) {
            conn.reset_auth_key();
        }
    }

    fn collect(&mut self, conn: &Connection) {
        let Some(entry) = self.dcs.get_mut(&conn.dc_id()) else { return };
        match conn.stored_key() {
            Some(key) => {
                entry.auth_key = Some(key.auth_key);
                entry.first_salt = key.first_salt;
                entry.time_offset = key.time_offset;
            }
            None => entry.auth_key = None,
        }
    }

    /// Current keys, salts and addresses.
    pub fn snapshot(&mut self) -> PersistedSession {
        let conns: Vec<Connection> = self.conns.values().cloned().collect();
        for conn in &conns {
            self.collect(conn);
        }
        let mut dcs: Vec<DcEntry> = self.dcs.values().cloned().collect();
        dcs.sort_by_key(|d| d.dc_id);
        PersistedSession { home_dc_id: self.home_dc_id, dcs }
    }

    pub fn save(&mut self) -> io::Result<()> {
        let session = self.snapshot();
        self.backend.save(&session)?;
        tracing::debug!("[ferry] session saved ({})", self.backend.name());
        Ok(())
    }

    /// Close every connection. No new ones are opened afterwards.
    pub fn close(&mut self) -> Vec<Connection> {
        self.closed = true;
        let conns: Vec<Connection> = self.conns.values().cloned().collect();
        for conn in &conns {
            conn.close();
        }
        conns
    }
}
