//! `AuthKey`: the 256-byte key derived from the DH handshake.

use crate::CryptoProvider;

/// Whether a key is long-lived or a short-lived key bound to a permanent one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// Created once per DC and persisted.
    Permanent,
    /// Created with `p_q_inner_data_temp_dc`; never persisted.
    Temporary {
        /// Unix time after which the server forgets the key.
        expires_at: i32,
        /// Id of the permanent key this one is bound to (0 until bound).
        perm_key_id: i64,
    },
}

/// A Telegram authorization key (256 bytes) plus pre-computed identifiers.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
    kind: KeyKind,
}

impl AuthKey {
    /// Construct a permanent key from raw 256-byte DH output.
    pub fn new(crypto: &dyn CryptoProvider, data: [u8; 256]) -> Self {
        let sha = crypto.sha1(&[&data[..]]);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id, kind: KeyKind::Permanent }
    }

    /// Mark this key as temporary (or re-mark it after binding).
    pub fn with_kind(mut self, kind: KeyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Return the raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] { self.data }

    /// The 8-byte key identifier (SHA-1(key)[12..20]).
    pub fn key_id(&self) -> [u8; 8] { self.key_id }

    /// The key identifier as the `long` the wire schema carries.
    pub fn id(&self) -> i64 { i64::from_le_bytes(self.key_id) }

    /// Permanent or temporary.
    pub fn kind(&self) -> KeyKind { self.kind }

    /// True for a temporary key whose lifetime ended at or before `now`.
    pub fn is_expired(&self, now: i32) -> bool {
        matches!(self.kind, KeyKind::Temporary { expires_at, .. } if expires_at <= now)
    }

    /// Compute the new-nonce hash needed for `DhGenOk/Retry/Fail` verification.
    pub fn calc_new_nonce_hash(&self, crypto: &dyn CryptoProvider, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = crypto.sha1(&[&new_nonce[..], &[number][..], &self.aux_hash[..]]);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={}, {:?})", self.id(), self.kind)
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool { self.key_id == other.key_id }
}
