//! Encrypted MTProto 2.0 session (post auth-key).
//!
//! Once you have a `Finished` from [`crate::authentication`], construct an
//! [`EncryptedSession`] and use it to envelope, encrypt, decrypt and
//! classify all subsequent messages. The session does no I/O.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ferry_crypto::{AuthKey, CryptoProvider, DequeBuffer, Side, decrypt_data_v2, encrypt_data_v2};
use ferry_tl::mtproto::{
    BadMsgNotification, BadServerSalt, FutureSalt, FutureSalts, GzipPacked, Message as Contained,
    MsgContainer, MsgDetailedInfo, MsgNewDetailedInfo, MsgsAck, NewSessionCreated, Pong,
    RpcError, RpcResult,
};
use ferry_tl::{DecodeError, Deserializable, Identifiable, Serializable, constructor_id};

use crate::message::{MessageId, MessageIdGenerator};

/// Most messages a single container may carry.
pub const MAX_CONTAINER_MESSAGES: usize = 100;

/// Largest container payload the server accepts.
pub const MAX_CONTAINER_BYTES: usize = 1024 * 1024;

// salt + session_id + msg_id + seq_no + length
const INNER_HEADER_LEN: usize = 8 + 8 + 8 + 4 + 4;

const RECENT_SERVER_IDS: usize = 500;

// Keeps `2 * sequence + 1` inside an i32. On wrap the server answers with
// bad_msg 32 and the session is started over.
const SEQUENCE_LIMIT: i32 = 1 << 30;

/// How far server message timestamps may stray from corrected local time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkewWindow {
    /// Oldest acceptable age.
    pub past:   Duration,
    /// Furthest acceptable lead.
    pub future: Duration,
}

impl Default for SkewWindow {
    fn default() -> Self {
        Self { past: Duration::from_secs(300), future: Duration::from_secs(30) }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors that can occur when decrypting a server message.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// The underlying crypto layer rejected the message.
    Crypto(ferry_crypto::DecryptError),
    /// The frame or decrypted plaintext is too short for its header.
    FrameTooShort,
    /// Session-ID mismatch (possible replay or wrong connection).
    SessionMismatch,
    /// Declared body length is misaligned or larger than the plaintext.
    InvalidLength { declared: usize, available: usize },
    /// Random padding outside 12..=1024 bytes.
    InvalidPadding { len: usize },
    /// Server message ids must be odd.
    EvenMessageId { msg_id: i64 },
    /// The id was already seen in this session.
    Duplicate { msg_id: i64 },
    /// The id's timestamp is outside the [`SkewWindow`].
    ///
    /// The frame itself was authentic, so the session has already adopted
    /// the server clock and started over: every unanswered call must be
    /// pushed again.
    OutOfWindow { msg_id: i64, server_time: i64 },
    /// Sent to a session this side has already replaced.
    RetiredSession,
}

impl DecryptError {
    /// Whether the connection can no longer be trusted.
    ///
    /// Non-fatal errors concern a single message, which is dropped.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::EvenMessageId { .. }
                | Self::Duplicate { .. }
                | Self::OutOfWindow { .. }
                | Self::RetiredSession
        )
    }
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort => write!(f, "inner plaintext too short"),
            Self::SessionMismatch => write!(f, "session_id mismatch"),
            Self::InvalidLength { declared, available } => {
                write!(f, "body length {declared} invalid for {available} available bytes")
            }
            Self::InvalidPadding { len } => write!(f, "padding of {len} bytes out of range"),
            Self::EvenMessageId { msg_id } => write!(f, "server msg_id {msg_id} is even"),
            Self::Duplicate { msg_id } => write!(f, "duplicate msg_id {msg_id}"),
            Self::OutOfWindow { msg_id, server_time } => {
                write!(f, "msg_id {msg_id} outside the time window around {server_time}")
            }
            Self::RetiredSession => write!(f, "message for a previous session"),
        }
    }
}
impl std::error::Error for DecryptError {}

impl From<ferry_crypto::DecryptError> for DecryptError {
    fn from(e: ferry_crypto::DecryptError) -> Self { Self::Crypto(e) }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

/// The inner message extracted from a verified server frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// `salt` sent by the server.
    pub salt:   i64,
    /// `msg_id` of the inner message.
    pub msg_id: MessageId,
    /// `seq_no` of the inner message.
    pub seq_no: i32,
    /// TL-serialized body.
    pub body:   Vec<u8>,
}

/// An encrypted frame produced by [`EncryptedSession::finalize`].
#[derive(Debug)]
pub struct Outgoing {
    /// `auth_key_id ‖ msg_key ‖ ciphertext`, ready for a packet codec.
    pub data:    Vec<u8>,
    /// Id of the outer message: the container if one was needed.
    pub msg_id:  MessageId,
    /// Ids of every message carried, in order.
    pub msg_ids: Vec<MessageId>,
}

/// A server message, after containers and compression are unwrapped.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Successful answer to `req_msg_id`.
    RpcResult { req_msg_id: MessageId, body: Vec<u8> },
    /// Failed answer to `req_msg_id`.
    RpcError { req_msg_id: MessageId, error: RpcError },
    /// The server received these messages.
    Ack { msg_ids: Vec<MessageId> },
    /// Answer to a ping.
    Pong { msg_id: MessageId, ping_id: i64 },
    /// The server rejected `bad_msg_id`.
    ///
    /// When `session_reset` is set the session id changed and everything
    /// unanswered must be sent again.
    BadMsg { bad_msg_id: MessageId, code: i32, session_reset: bool },
    /// `bad_msg_id` used a stale salt; the salt is already replaced.
    BadSalt { bad_msg_id: MessageId, new_salt: i64 },
    /// The server started a new session; calls before `first_msg_id` are lost.
    NewSession { first_msg_id: MessageId },
    /// Future salts were received and cached.
    FutureSalts { req_msg_id: MessageId },
    /// Anything the engine does not interpret.
    Update { msg_id: MessageId, body: Vec<u8> },
}

/// The result of [`EncryptedSession::classify`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classified {
    /// Events in arrival order.
    pub events: Vec<Inbound>,
    /// Content-related ids that must be acknowledged.
    pub acks:   Vec<MessageId>,
}

// ─── Session ─────────────────────────────────────────────────────────────────

struct Queued {
    msg_id: MessageId,
    seq_no: i32,
    body:   Vec<u8>,
}

/// MTProto 2.0 encrypted session state.
///
/// Wraps an `AuthKey` and tracks per-session counters (session_id, seq_no,
/// message ids, server salts). Queue messages with [`Self::push`], encrypt
/// them with [`Self::finalize`], and feed server frames to
/// [`Self::decrypt`] followed by [`Self::classify`].
pub struct EncryptedSession {
    crypto:        Arc<dyn CryptoProvider>,
    auth_key:      AuthKey,
    session_id:    i64,
    retired:       Option<i64>,
    sequence:      i32,
    ids:           MessageIdGenerator,
    salt:          i64,
    future_salts:  Vec<FutureSalt>,
    window:        SkewWindow,
    recent_ids:    VecDeque<i64>,
    queue:         Vec<Queued>,
    queued_bytes:  usize,
}

impl std::fmt::Debug for EncryptedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSession")
            .field("auth_key", &self.auth_key)
            .field("session_id", &self.session_id)
            .field("salt", &self.salt)
            .field("time_offset", &self.ids.time_offset())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl EncryptedSession {
    /// Create a new encrypted session from the output of `authentication::finish`
    /// (or a stored key).
    pub fn new(
        crypto:      Arc<dyn CryptoProvider>,
        auth_key:    AuthKey,
        first_salt:  i64,
        time_offset: i32,
    ) -> Self {
        Self {
            crypto,
            auth_key,
            session_id: random_i64(),
            retired: None,
            sequence: 0,
            ids: MessageIdGenerator::new(time_offset),
            salt: first_salt,
            future_salts: Vec::new(),
            window: SkewWindow::default(),
            recent_ids: VecDeque::with_capacity(RECENT_SERVER_IDS),
            queue: Vec::new(),
            queued_bytes: 0,
        }
    }

    /// Replace the accepted clock skew.
    pub fn with_skew_window(mut self, window: SkewWindow) -> Self {
        self.window = window;
        self
    }

    /// The key messages are encrypted with.
    pub fn auth_key(&self) -> &AuthKey { &self.auth_key }

    /// Return the current session_id.
    pub fn session_id(&self) -> i64 { self.session_id }

    /// Salt used for the next outgoing frame.
    pub fn salt(&self) -> i64 { self.salt }

    /// Clock skew in seconds vs. server.
    pub fn time_offset(&self) -> i32 { self.ids.time_offset() }

    /// Number of messages waiting for [`Self::finalize`].
    pub fn queued(&self) -> usize { self.queue.len() }

    /// Start a new session: fresh id, sequence and message ids.
    ///
    /// Queued messages are dropped; the server forgets nothing it already
    /// answered, but unanswered calls must be pushed again.
    pub fn reset_session(&mut self) {
        self.retired = Some(self.session_id);
        self.session_id = random_i64();
        self.sequence = 0;
        self.ids.reset();
        self.recent_ids.clear();
        self.queue.clear();
        self.queued_bytes = 0;
        log::info!("[ferry] new session {:#018x}", self.session_id);
    }

    /// Allocate a message id without queueing anything.
    ///
    /// Use with [`Self::push_with_msg_id`] when the body must embed its own id.
    pub fn allocate_msg_id(&mut self) -> MessageId {
        self.ids.next()
    }

    /// Queue `body`. Returns its msg id, or `None` when the next frame is full.
    pub fn push(&mut self, body: Vec<u8>, content_related: bool) -> Option<MessageId> {
        if !self.fits(body.len()) {
            return None;
        }
        let msg_id = self.ids.next();
        self.enqueue(msg_id, body, content_related);
        Some(msg_id)
    }

    /// Queue `body` under an id from [`Self::allocate_msg_id`].
    pub fn push_with_msg_id(&mut self, msg_id: MessageId, body: Vec<u8>, content_related: bool) -> bool {
        if !self.fits(body.len()) {
            return false;
        }
        self.enqueue(msg_id, body, content_related);
        true
    }

    fn fits(&self, len: usize) -> bool {
        if self.queue.is_empty() {
            return true;
        }
        self.queue.len() < MAX_CONTAINER_MESSAGES
            && self.queued_bytes + Contained::HEADER_LEN + len
                <= MAX_CONTAINER_BYTES - MsgContainer::HEADER_LEN
    }

    fn enqueue(&mut self, msg_id: MessageId, body: Vec<u8>, content_related: bool) {
        let seq_no = self.next_seq_no(content_related);
        self.queued_bytes += Contained::HEADER_LEN + body.len();
        self.queue.push(Queued { msg_id, seq_no, body });
    }

    /// Content-related messages take odd numbers and advance the counter.
    fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence = (self.sequence + 1) % SEQUENCE_LIMIT;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Encrypt everything queued into one frame.
    pub fn finalize(&mut self) -> Option<Outgoing> {
        self.finalize_at(SystemTime::now())
    }

    /// [`Self::finalize`] as if the local clock read `now`.
    pub fn finalize_at(&mut self, now: SystemTime) -> Option<Outgoing> {
        if self.queue.is_empty() {
            return None;
        }
        let mut queue = std::mem::take(&mut self.queue);
        self.queued_bytes = 0;
        let msg_ids: Vec<MessageId> = queue.iter().map(|m| m.msg_id).collect();

        let (msg_id, seq_no, body) = if queue.len() == 1 {
            let Queued { msg_id, seq_no, body } = queue.pop()?;
            (msg_id, seq_no, body)
        } else {
            let container = MsgContainer {
                messages: queue
                    .into_iter()
                    .map(|m| Contained { msg_id: m.msg_id.0, seqno: m.seq_no, body: m.body })
                    .collect(),
            };
            let id = self.ids.next_at(now);
            let seq_no = self.next_seq_no(false);
            (id, seq_no, container.to_bytes())
        };

        self.refresh_salt(self.ids.server_now(now));

        let mut buf = DequeBuffer::with_capacity(INNER_HEADER_LEN + body.len(), 24);
        buf.extend(self.salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(msg_id.0.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend(body.iter().copied());

        encrypt_data_v2(self.crypto.as_ref(), &mut buf, &self.auth_key, Side::Client);
        Some(Outgoing { data: buf.as_ref().to_vec(), msg_id, msg_ids })
    }

    /// Decrypt and verify a server frame.
    pub fn decrypt(&mut self, frame: &mut [u8]) -> Result<Envelope, DecryptError> {
        self.decrypt_at(frame, SystemTime::now())
    }

    /// [`Self::decrypt`] as if the local clock read `now`.
    pub fn decrypt_at(&mut self, frame: &mut [u8], now: SystemTime) -> Result<Envelope, DecryptError> {
        if frame.len() < 24 {
            return Err(DecryptError::FrameTooShort);
        }
        // Padded transports may append up to 15 bytes after the ciphertext.
        let usable = 24 + (frame.len() - 24) / 16 * 16;
        let plaintext = decrypt_data_v2(
            self.crypto.as_ref(), &mut frame[..usable], &self.auth_key, Side::Server,
        )?;

        if plaintext.len() < INNER_HEADER_LEN {
            return Err(DecryptError::FrameTooShort);
        }

        let salt       = read_i64(&plaintext[..8]);
        let session_id = read_i64(&plaintext[8..16]);
        let msg_id     = read_i64(&plaintext[16..24]);
        let seq_no     = read_i64(&plaintext[24..28]) as i32;
        let declared   = read_i64(&plaintext[28..32]) as u32 as usize;
        let available  = plaintext.len() - INNER_HEADER_LEN;

        if session_id != self.session_id {
            if Some(session_id) == self.retired {
                return Err(DecryptError::RetiredSession);
            }
            return Err(DecryptError::SessionMismatch);
        }
        if declared % 4 != 0 || declared > available {
            return Err(DecryptError::InvalidLength { declared, available });
        }
        let padding = available - declared;
        if !(12..=1024).contains(&padding) {
            return Err(DecryptError::InvalidPadding { len: padding });
        }
        if msg_id % 2 == 0 {
            return Err(DecryptError::EvenMessageId { msg_id });
        }

        let server_time = self.ids.server_now(now);
        let secs = msg_id >> 32;
        if secs < server_time - self.window.past.as_secs() as i64
            || secs > server_time + self.window.future.as_secs() as i64
        {
            self.ids.correct(msg_id, now);
            log::warn!(
                "[ferry] server msg_id {msg_id} is {}s away from our clock, time offset now {}s",
                secs - server_time, self.ids.time_offset()
            );
            self.reset_session();
            return Err(DecryptError::OutOfWindow { msg_id, server_time });
        }

        if self.recent_ids.contains(&msg_id) {
            return Err(DecryptError::Duplicate { msg_id });
        }
        if self.recent_ids.len() == RECENT_SERVER_IDS {
            self.recent_ids.pop_front();
        }
        self.recent_ids.push_back(msg_id);

        let body = plaintext[INNER_HEADER_LEN..INNER_HEADER_LEN + declared].to_vec();
        Ok(Envelope { salt, msg_id: MessageId(msg_id), seq_no, body })
    }

    /// Unwrap containers and compression and interpret service messages.
    ///
    /// Salt changes, time corrections and cached future salts are applied
    /// to the session before returning.
    pub fn classify(&mut self, envelope: Envelope) -> Classified {
        self.classify_at(envelope, SystemTime::now())
    }

    /// [`Self::classify`] as if the local clock read `now`.
    pub fn classify_at(&mut self, envelope: Envelope, now: SystemTime) -> Classified {
        let mut out = Classified::default();
        self.dispatch(envelope.msg_id, envelope.seq_no, envelope.body, true, now, &mut out);
        out
    }

    fn dispatch(
        &mut self,
        msg_id:    MessageId,
        seq_no:    i32,
        body:      Vec<u8>,
        outermost: bool,
        now:       SystemTime,
        out:       &mut Classified,
    ) {
        if seq_no & 1 == 1 {
            out.acks.push(msg_id);
        }
        if let Err(e) = self.interpret(msg_id, body, outermost, now, out) {
            log::warn!("[ferry] dropping undecodable message {}: {e}", msg_id.0);
        }
    }

    fn interpret(
        &mut self,
        msg_id:    MessageId,
        body:      Vec<u8>,
        outermost: bool,
        now:       SystemTime,
        out:       &mut Classified,
    ) -> Result<(), DecodeError> {
        match constructor_id(&body)? {
            MsgContainer::CONSTRUCTOR_ID if outermost => {
                let container = MsgContainer::from_bytes(&body)?;
                for m in container.messages {
                    self.dispatch(MessageId(m.msg_id), m.seqno, m.body, false, now, out);
                }
            }
            GzipPacked::CONSTRUCTOR_ID => {
                let packed = GzipPacked::from_bytes(&body)?;
                let unpacked = gz_inflate(&packed.packed_data)?;
                // The ack, if any, was already recorded for the wrapper.
                return self.interpret(msg_id, unpacked, false, now, out);
            }
            RpcResult::CONSTRUCTOR_ID => {
                let result = RpcResult::from_bytes(&body)?;
                let req_msg_id = MessageId(result.req_msg_id);
                let mut inner = result.result.0;
                if constructor_id(&inner)? == GzipPacked::CONSTRUCTOR_ID {
                    inner = gz_inflate(&GzipPacked::from_bytes(&inner)?.packed_data)?;
                }
                if constructor_id(&inner)? == RpcError::CONSTRUCTOR_ID {
                    let error = RpcError::from_bytes(&inner)?;
                    out.events.push(Inbound::RpcError { req_msg_id, error });
                } else {
                    out.events.push(Inbound::RpcResult { req_msg_id, body: inner });
                }
            }
            MsgsAck::CONSTRUCTOR_ID => {
                let ack = MsgsAck::from_bytes(&body)?;
                out.events.push(Inbound::Ack {
                    msg_ids: ack.msg_ids.into_iter().map(MessageId).collect(),
                });
            }
            Pong::CONSTRUCTOR_ID => {
                let pong = Pong::from_bytes(&body)?;
                out.events.push(Inbound::Pong { msg_id: MessageId(pong.msg_id), ping_id: pong.ping_id });
            }
            BadMsgNotification::CONSTRUCTOR_ID => {
                let bad = BadMsgNotification::from_bytes(&body)?;
                let session_reset = match bad.error_code {
                    // msg_id too low / too high: our clock is off.
                    16 | 17 => {
                        let reset = self.ids.correct(msg_id.0, now);
                        log::info!(
                            "[ferry] corrected time offset to {}s (code {})",
                            self.ids.time_offset(), bad.error_code
                        );
                        reset
                    }
                    // seq_no too low / too high: restart numbering.
                    32 | 33 => true,
                    _ => false,
                };
                if session_reset {
                    self.reset_session();
                }
                out.events.push(Inbound::BadMsg {
                    bad_msg_id: MessageId(bad.bad_msg_id),
                    code: bad.error_code,
                    session_reset,
                });
            }
            BadServerSalt::CONSTRUCTOR_ID => {
                let bad = BadServerSalt::from_bytes(&body)?;
                self.salt = bad.new_server_salt;
                self.future_salts.clear();
                out.events.push(Inbound::BadSalt {
                    bad_msg_id: MessageId(bad.bad_msg_id),
                    new_salt: bad.new_server_salt,
                });
            }
            NewSessionCreated::CONSTRUCTOR_ID => {
                let created = NewSessionCreated::from_bytes(&body)?;
                self.salt = created.server_salt;
                out.events.push(Inbound::NewSession { first_msg_id: MessageId(created.first_msg_id) });
            }
            FutureSalts::CONSTRUCTOR_ID => {
                let salts = FutureSalts::from_bytes(&body)?;
                let req_msg_id = MessageId(salts.req_msg_id);
                self.add_future_salts(salts.salts);
                out.events.push(Inbound::FutureSalts { req_msg_id });
            }
            MsgDetailedInfo::CONSTRUCTOR_ID => {
                let info = MsgDetailedInfo::from_bytes(&body)?;
                out.acks.push(MessageId(info.answer_msg_id));
                out.events.push(Inbound::Ack { msg_ids: vec![MessageId(info.msg_id)] });
            }
            MsgNewDetailedInfo::CONSTRUCTOR_ID => {
                let info = MsgNewDetailedInfo::from_bytes(&body)?;
                out.acks.push(MessageId(info.answer_msg_id));
            }
            _ => out.events.push(Inbound::Update { msg_id, body }),
        }
        Ok(())
    }

    // ── Salts ────────────────────────────────────────────────────────────────

    /// Merge salts from `get_future_salts` into the cache.
    pub fn add_future_salts(&mut self, salts: Vec<FutureSalt>) {
        for salt in salts {
            if !self.future_salts.iter().any(|s| s.salt == salt.salt) {
                self.future_salts.push(salt);
            }
        }
        self.future_salts.sort_by_key(|s| s.valid_since);
    }

    /// True when fewer than two cached salts remain usable.
    pub fn needs_future_salts(&self, now: SystemTime) -> bool {
        let server_now = self.ids.server_now(now);
        self.future_salts
            .iter()
            .filter(|s| i64::from(s.valid_until) > server_now)
            .count()
            < 2
    }

    fn refresh_salt(&mut self, server_now: i64) {
        self.future_salts.retain(|s| i64::from(s.valid_until) > server_now);
        if let Some(current) = self
            .future_salts
            .iter()
            .rev()
            .find(|s| i64::from(s.valid_since) <= server_now)
        {
            self.salt = current.salt;
        }
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut word = [0u8; 8];
    word[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(word)
}

fn random_i64() -> i64 {
    let mut rnd = [0u8; 8];
    getrandom::getrandom(&mut rnd).expect("getrandom");
    i64::from_le_bytes(rnd)
}

/// Inflate a `gzip_packed` payload (gzip, falling back to raw zlib).
pub fn gz_inflate(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| DecodeError::InvalidGzip)?;
    Ok(out)
}
