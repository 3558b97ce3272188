//! Session persistence: permanent auth keys, salts, time offsets and the DC table.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;

/// What is remembered about one DC between runs.
#[derive(Clone, PartialEq)]
pub struct DcEntry {
    pub dc_id:       i32,
    pub addr:        String,
    /// Permanent key; temporary keys are never stored.
    pub auth_key:    Option<[u8; 256]>,
    pub first_salt:  i64,
    pub time_offset: i32,
}

impl DcEntry {
    /// An entry with only an address.
    pub fn new(dc_id: i32, addr: impl Into<String>) -> Self {
        Self { dc_id, addr: addr.into(), auth_key: None, first_salt: 0, time_offset: 0 }
    }
}

impl fmt::Debug for DcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DcEntry")
            .field("dc_id", &self.dc_id)
            .field("addr", &self.addr)
            .field("auth_key", &self.auth_key.map(|_| "<256 bytes>"))
            .field("first_salt", &self.first_salt)
            .field("time_offset", &self.time_offset)
            .finish()
    }
}

/// Everything a [`crate::session_backend::SessionBackend`] stores.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedSession {
    pub home_dc_id: i32,
    pub dcs:        Vec<DcEntry>,
}

impl PersistedSession {
    /// Compact binary encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&self.home_dc_id.to_le_bytes());
        let dcs = &self.dcs[..self.dcs.len().min(u8::MAX as usize)];
        b.push(dcs.len() as u8);
        for d in dcs {
            b.extend_from_slice(&d.dc_id.to_le_bytes());
            match &d.auth_key {
                Some(k) => { b.push(1); b.extend_from_slice(k); }
                None    => { b.push(0); }
            }
            b.extend_from_slice(&d.first_salt.to_le_bytes());
            b.extend_from_slice(&d.time_offset.to_le_bytes());
            let ab = &d.addr.as_bytes()[..d.addr.len().min(u8::MAX as usize)];
            b.push(ab.len() as u8);
            b.extend_from_slice(ab);
        }
        b
    }

    /// Parse [`Self::to_bytes`] output.
    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated session"));
                }
                let mut a = [0u8; $n];
                a.copy_from_slice(&buf[p..p + $n]);
                p += $n;
                a
            }};
        }
        let home_dc_id = i32::from_le_bytes(r!(4));
        let dc_count   = r!(1)[0] as usize;
        let mut dcs    = Vec::with_capacity(dc_count);
        for _ in 0..dc_count {
            let dc_id    = i32::from_le_bytes(r!(4));
            let auth_key = match r!(1)[0] {
                0 => None,
                1 => Some(r!(256)),
                _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad key flag")),
            };
            let first_salt  = i64::from_le_bytes(r!(8));
            let time_offset = i32::from_le_bytes(r!(4));
            let al          = r!(1)[0] as usize;
            if p + al > buf.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated session"));
            }
            let addr = String::from_utf8_lossy(&buf[p..p + al]).into_owned();
            p += al;
            dcs.push(DcEntry { dc_id, addr, auth_key, first_salt, time_offset });
        }
        Ok(Self { home_dc_id, dcs })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        // Write-then-rename so a crash never leaves half a file behind.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_bytes())?;
        std::fs::rename(&tmp, path)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// The stored entry for `dc_id`, if any.
    pub fn dc(&self, dc_id: i32) -> Option<&DcEntry> {
        self.dcs.iter().find(|d| d.dc_id == dc_id)
    }
}

/// Bootstrap DC address table.
pub fn default_dc_addresses() -> HashMap<i32, String> {
    [
        (1, "149.154.175.53:443"),
        (2, "149.154.167.51:443"),
        (3, "149.154.175.100:443"),
        (4, "149.154.167.91:443"),
        (5, "91.108.56.130:443"),
    ]
    .into_iter()
    .map(|(id, addr)| (id, addr.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedSession {
        let mut keyed = DcEntry::new(2, "149.154.167.51:443");
        keyed.auth_key = Some([7; 256]);
        keyed.first_salt = -5;
        keyed.time_offset = 12;
        PersistedSession { home_dc_id: 2, dcs: vec![DcEntry::new(1, "10.0.0.1:443"), keyed] }
    }

    #[test]
    fn binary_format_keeps_every_field() {
        let s = sample();
        assert_eq!(PersistedSession::from_bytes(&s.to_bytes()).unwrap(), s);
        assert_eq!(s.dc(2).unwrap().time_offset, 12);
        assert!(s.dc(3).is_none());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = sample().to_bytes();
        for cut in [0, 3, 5, 40, bytes.len() - 1] {
            let err = PersistedSession::from_bytes(&bytes[..cut]).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn debug_hides_keys() {
        let s = format!("{:?}", sample());
        assert!(s.contains("<256 bytes>"));
        assert!(!s.contains("7, 7, 7"));
    }
}
