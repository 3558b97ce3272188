//! Message identifiers and plaintext framing.

use std::time::{SystemTime, UNIX_EPOCH};

/// A 64-bit MTProto message identifier.
///
/// The upper 32 bits are the (server-corrected) Unix time in seconds, the
/// lower 32 bits a sub-second fraction. Client ids are divisible by 4;
/// server ids are odd.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Unix seconds encoded in the id.
    pub fn secs(self) -> i64 { self.0 >> 32 }
}

/// Generates strictly increasing client message ids from the wall clock.
#[derive(Clone, Debug, Default)]
pub struct MessageIdGenerator {
    last: i64,
    time_offset: i32,
}

impl MessageIdGenerator {
    /// Start a generator whose clock is shifted by `time_offset` seconds.
    pub fn new(time_offset: i32) -> Self {
        Self { last: 0, time_offset }
    }

    /// Seconds added to the local clock to approximate server time.
    pub fn time_offset(&self) -> i32 { self.time_offset }

    /// The most recently issued id (0 if none yet).
    pub fn last(&self) -> i64 { self.last }

    /// Allocate the next id from the system clock.
    pub fn next(&mut self) -> MessageId {
        self.next_at(SystemTime::now())
    }

    /// Allocate the next id as if the local clock read `now`.
    ///
    /// Ids are at least 4 apart even when the clock stalls or moves backwards.
    pub fn next_at(&mut self, now: SystemTime) -> MessageId {
        let mut id = self.id_for(now);
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        MessageId(id)
    }

    /// Re-synchronise the clock from an id the server generated.
    ///
    /// Returns `true` if ids computed from the corrected clock would fall
    /// below those already issued; the caller must then start a new session,
    /// after which [`Self::reset`] lets ids follow the corrected clock.
    pub fn correct(&mut self, server_msg_id: i64, now: SystemTime) -> bool {
        let local = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let server = server_msg_id >> 32;
        self.time_offset = (server - local) as i32;
        self.id_for(now) <= self.last
    }

    /// Forget the last issued id (only valid together with a new session id).
    pub fn reset(&mut self) {
        self.last = 0;
    }

    /// Current server-corrected Unix time.
    pub fn server_now(&self, now: SystemTime) -> i64 {
        now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
            + i64::from(self.time_offset)
    }

    fn id_for(&self, now: SystemTime) -> i64 {
        let elapsed = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = self.server_now(now) as u64;
        // nanos < 2^30, so the shifted value always fits in the low half.
        let fraction = u64::from(elapsed.subsec_nanos()) << 2;
        ((secs << 32) | fraction) as i64
    }
}

/// A framed MTProto message ready to be sent.
#[derive(Debug)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// The serialized TL body (constructor ID + fields).
    pub body: Vec<u8>,
}

/// A plaintext frame could not be parsed.
#[derive(Clone, Debug, PartialEq)]
pub enum PlainError {
    /// Shorter than the 20-byte header.
    TooShort { len: usize },
    /// `auth_key_id` was not zero.
    NotPlaintext { auth_key_id: i64 },
    /// The declared body length does not match the frame.
    BadLength { declared: usize, available: usize },
}

impl std::fmt::Display for PlainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "plaintext frame of {len} bytes is too short"),
            Self::NotPlaintext { auth_key_id } => {
                write!(f, "expected plaintext frame, got auth_key_id {auth_key_id}")
            }
            Self::BadLength { declared, available } => {
                write!(f, "plaintext body declares {declared} bytes but {available} are present")
            }
        }
    }
}

impl std::error::Error for PlainError {}

impl Message {
    /// Construct a new plaintext message (used before key exchange).
    pub fn plaintext(id: MessageId, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Serialize the message into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.id.0.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }

    /// Parse the plaintext wire format (the inverse of [`Self::to_plaintext_bytes`]).
    pub fn from_plaintext_bytes(frame: &[u8]) -> Result<Self, PlainError> {
        if frame.len() < 20 {
            return Err(PlainError::TooShort { len: frame.len() });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&frame[..8]);
        let auth_key_id = i64::from_le_bytes(word);
        if auth_key_id != 0 {
            return Err(PlainError::NotPlaintext { auth_key_id });
        }
        word.copy_from_slice(&frame[8..16]);
        let id = MessageId(i64::from_le_bytes(word));

        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[16..20]);
        let declared = u32::from_le_bytes(len) as usize;
        let available = frame.len() - 20;
        if declared > available {
            return Err(PlainError::BadLength { declared, available });
        }
        Ok(Self { id, body: frame[20..20 + declared].to_vec() })
    }
}
