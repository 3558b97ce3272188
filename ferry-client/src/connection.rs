//! One long-lived connection to one DC.
//!
//! A [`Connection`] is a cheap handle to a tokio task. The task owns the
//! stream, the packet codec, the [`EncryptedSession`] and the table of
//! calls waiting for an answer, so none of that state is ever touched from
//! two places at once. Callers talk to it over a channel and get their
//! answer through a oneshot.
//!
//! ```text
//! Idle → Connecting → (Handshaking) → Ready ─┐
//!           ▲                                │ I/O error, bad frame, silence
//!           └──────── Reconnecting ◄─────────┘
//! any state ── close() ──► Closed
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ferry_crypto::{AuthKey, CryptoProvider, KeyKind};
use ferry_mtproto::authentication::{self as auth, Finished, KeyRequest};
use ferry_mtproto::encrypted::{Classified, DecryptError, SkewWindow};
use ferry_mtproto::session::UnpackError;
use ferry_mtproto::transport::{FrameError, PacketCodec};
use ferry_mtproto::{EncryptedSession, Inbound, MessageId, Session};
use ferry_tl::mtproto::{GetFutureSalts, MsgsAck, PingDelayDisconnect, Pong};
use ferry_tl::{Deserializable, RemoteCall, Serializable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::errors::InvocationError;
use crate::retry::Backoff;
use crate::transport::{BoxStream, Connector, TransportKind};

/// Extra seconds the server waits after a missed ping before dropping us.
const DISCONNECT_GRACE: Duration = Duration::from_secs(15);

/// How long one handshake or bind round-trip may take.
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// Temporary keys are replaced this long before they expire.
const TEMP_KEY_MARGIN: i32 = 60;

const BIND_ATTEMPTS: usize = 3;

const FUTURE_SALTS: i32 = 64;

const READ_CHUNK: usize = 64 * 1024;

// ─── Public types ─────────────────────────────────────────────────────────────

/// Lifecycle of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing attempted yet.
    Idle,
    /// Opening the stream.
    Connecting,
    /// Negotiating an auth key (or binding a temporary one).
    Handshaking,
    /// Encrypted traffic flows.
    Ready,
    /// The link was lost; waiting out the backoff.
    Reconnecting,
    /// Shut down for good.
    Closed,
}

/// The permanent key of a DC together with its last known salt and clock skew.
#[derive(Clone, PartialEq)]
pub struct StoredKey {
    pub auth_key:    [u8; 256],
    pub first_salt:  i64,
    pub time_offset: i32,
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("auth_key", &format_args!("<{} bytes>", self.auth_key.len()))
            .field("first_salt", &self.first_salt)
            .field("time_offset", &self.time_offset)
            .finish()
    }
}

/// Everything a connection task needs besides its address.
pub(crate) struct Settings {
    pub transport:          TransportKind,
    pub connector:          Arc<dyn Connector>,
    pub crypto:             Arc<dyn CryptoProvider>,
    pub backoff:            Backoff,
    pub skew_window:        SkewWindow,
    pub ping_interval:      Duration,
    pub ack_interval:       Duration,
    pub ack_threshold:      usize,
    pub handshake_attempts: u32,
    pub temp_key_lifetime:  Option<Duration>,
}

type Reply = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

struct Request {
    body:  Vec<u8>,
    reply: Reply,
}

enum Command {
    Call(Request),
    ResetKey,
}

/// Handle to the task serving one DC.
#[derive(Clone)]
pub struct Connection {
    dc_id:    i32,
    commands: mpsc::UnboundedSender<Command>,
    state:    watch::Receiver<ConnectionState>,
    key:      watch::Receiver<Option<StoredKey>>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Start the task for `dc_id` at `addr`. It connects right away.
    pub(crate) fn spawn(
        dc_id:    i32,
        addr:     String,
        stored:   Option<StoredKey>,
        settings: Arc<Settings>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (key_tx, key_rx) = watch::channel(stored);
        let shutdown = CancellationToken::new();

        let worker = Worker {
            dc_id,
            addr,
            settings,
            commands: commands_rx,
            state: state_tx,
            key: key_tx,
            shutdown: shutdown.clone(),
            queue: VecDeque::new(),
            pending: BTreeMap::new(),
            acks: Vec::new(),
            salts_request: None,
            next_ping_id: 0,
        };
        tokio::spawn(worker.run());

        Self { dc_id, commands: commands_tx, state: state_rx, key: key_rx, shutdown }
    }

    pub fn dc_id(&self) -> i32 { self.dc_id }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState { *self.state.borrow() }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> { self.state.clone() }

    /// The permanent key in use, once one exists.
    pub fn stored_key(&self) -> Option<StoredKey> { self.key.borrow().clone() }

    pub(crate) fn watch_key(&self) -> watch::Receiver<Option<StoredKey>> { self.key.clone() }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.commands.is_closed()
    }

    /// Send a serialized request and wait for the raw answer.
    ///
    /// Dropping the returned future abandons the call; the task forgets it
    /// the next time it looks.
    pub async fn invoke_raw(&self, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call(Request { body, reply }))
            .map_err(|_| InvocationError::ConnectionClosed)?;
        rx.await.unwrap_or(Err(InvocationError::ConnectionClosed))
    }

    /// Forget the auth key and negotiate a new one.
    pub fn reset_auth_key(&self) {
        let _ = self.commands.send(Command::ResetKey);
    }

    /// Shut down. Every call still waiting fails with
    /// [`InvocationError::ConnectionClosed`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Wait until the task has finished.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

// ─── Link ─────────────────────────────────────────────────────────────────────

/// A stream with its framing.
struct Link {
    stream: BoxStream,
    codec:  Box<dyn PacketCodec>,
    rx:     Vec<u8>,
    chunk:  Vec<u8>,
}

impl Link {
    fn new(stream: BoxStream, codec: Box<dyn PacketCodec>) -> Self {
        Self { stream, codec, rx: Vec::new(), chunk: vec![0; READ_CHUNK] }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), InvocationError> {
        let mut out = Vec::with_capacity(payload.len() + 80);
        self.codec.pack(payload, &mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read whatever is available. Cancel safe.
    async fn fill(&mut self) -> Result<(), InvocationError> {
        let n = self.stream.read(&mut self.chunk).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        self.codec.deobfuscate(&mut self.chunk[..n]);
        self.rx.extend_from_slice(&self.chunk[..n]);
        Ok(())
    }

    /// Take the next whole packet out of the buffer, if there is one.
    fn next_packet(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.codec.unpack(&self.rx) {
            Ok(p) => {
                let data = self.rx[p.data_start..p.data_end].to_vec();
                self.rx.drain(..p.next_offset);
                Ok(Some(data))
            }
            Err(FrameError::MissingBytes) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>, InvocationError> {
        loop {
            if let Some(packet) = self.next_packet()? {
                return Ok(packet);
            }
            self.fill().await?;
        }
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

struct InFlight {
    request:   Request,
    container: Option<MessageId>,
}

enum End {
    Shutdown,
    Lost(InvocationError),
    /// Reconnect right away, without backoff.
    Renew(&'static str),
}

struct Worker {
    dc_id:         i32,
    addr:          String,
    settings:      Arc<Settings>,
    commands:      mpsc::UnboundedReceiver<Command>,
    state:         watch::Sender<ConnectionState>,
    key:           watch::Sender<Option<StoredKey>>,
    shutdown:      CancellationToken,
    /// Not yet handed to the session.
    queue:         VecDeque<Request>,
    /// Sent, waiting for an answer.
    pending:       BTreeMap<MessageId, InFlight>,
    acks:          Vec<i64>,
    salts_request: Option<MessageId>,
    next_ping_id:  i64,
}

impl Worker {
    async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let mut attempt = 0u32;

        loop {
            let established = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                r = self.establish() => r,
            };

            let mut renew = false;
            match established {
                Ok((link, session)) => {
                    attempt = 0;
                    match self.serve(link, session, &shutdown).await {
                        End::Shutdown => break,
                        End::Lost(e) => {
                            tracing::warn!("[ferry] DC{} link lost: {e}", self.dc_id);
                        }
                        End::Renew(why) => {
                            tracing::info!("[ferry] DC{} reconnecting: {why}", self.dc_id);
                            renew = true;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[ferry] DC{} connect failed: {e}", self.dc_id);
                    if matches!(e, InvocationError::KeyExchange(_)) {
                        self.drain_commands();
                        for req in self.queue.drain(..) {
                            let _ = req.reply.send(Err(e.duplicate()));
                        }
                    }
                }
            }

            self.state.send_replace(ConnectionState::Reconnecting);
            if renew {
                continue;
            }
            let delay = self.settings.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::debug!("[ferry] DC{} retrying in {delay:?}", self.dc_id);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.close_all();
    }

    fn close_all(&mut self) {
        self.commands.close();
        self.drain_commands();
        let waiting = self.pending.len() + self.queue.len();
        for (_, f) in std::mem::take(&mut self.pending) {
            let _ = f.request.reply.send(Err(InvocationError::ConnectionClosed));
        }
        for req in self.queue.drain(..) {
            let _ = req.reply.send(Err(InvocationError::ConnectionClosed));
        }
        self.state.send_replace(ConnectionState::Closed);
        tracing::info!("[ferry] DC{} closed ({waiting} calls dropped)", self.dc_id);
    }

    /// Move everything sitting in the channel into the queue.
    ///
    /// Returns `true` if a key reset was requested.
    fn drain_commands(&mut self) -> bool {
        let mut reset = false;
        while let Ok(cmd) = self.commands.try_recv() {
            reset |= self.accept(cmd);
        }
        reset
    }

    fn accept(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Call(req) => {
                self.queue.push_back(req);
                false
            }
            Command::ResetKey => {
                self.key.send_replace(None);
                true
            }
        }
    }

    // ── Establishing ────────────────────────────────────────────────────────

    async fn establish(&mut self) -> Result<(Link, EncryptedSession), InvocationError> {
        self.state.send_replace(ConnectionState::Connecting);
        let settings = self.settings.clone();
        let stream = settings.connector.connect(&self.addr).await?;
        let codec = settings.transport.codec(settings.crypto.as_ref(), self.dc_id);
        let mut link = Link::new(stream, codec);

        let stored = self.key.borrow().clone();
        let perm = match stored {
            Some(key) => key,
            None => {
                self.state.send_replace(ConnectionState::Handshaking);
                let done = self.exchange(&mut link, KeyRequest::Permanent { dc_id: self.dc_id }).await?;
                let key = StoredKey {
                    auth_key:    done.auth_key.to_bytes(),
                    first_salt:  done.first_salt,
                    time_offset: done.time_offset,
                };
                self.key.send_replace(Some(key.clone()));
                key
            }
        };
        let perm_key = AuthKey::new(settings.crypto.as_ref(), perm.auth_key);

        let session = match settings.temp_key_lifetime {
            None => EncryptedSession::new(
                settings.crypto.clone(), perm_key, perm.first_salt, perm.time_offset,
            )
            .with_skew_window(settings.skew_window),
            Some(lifetime) => {
                self.state.send_replace(ConnectionState::Handshaking);
                self.bind_temp_key(&mut link, &perm_key, lifetime).await?
            }
        };

        self.state.send_replace(ConnectionState::Ready);
        tracing::info!("[ferry] DC{} ready ({})", self.dc_id, self.addr);
        Ok((link, session))
    }

    /// Run the key exchange, starting over with fresh nonces on failure.
    async fn exchange(&self, link: &mut Link, request: KeyRequest) -> Result<Finished, InvocationError> {
        let crypto = self.settings.crypto.as_ref();
        let mut last = auth::Error::DhGenFail;
        for attempt in 1..=self.settings.handshake_attempts.max(1) {
            match exchange_once(link, crypto, request).await {
                Ok(done) => return Ok(done),
                Err(InvocationError::KeyExchange(e)) => {
                    tracing::warn!("[ferry] DC{} key exchange attempt {attempt} failed: {e}", self.dc_id);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(InvocationError::KeyExchange(last))
    }

    async fn bind_temp_key(
        &self,
        link:     &mut Link,
        perm_key: &AuthKey,
        lifetime: Duration,
    ) -> Result<EncryptedSession, InvocationError> {
        let settings = &self.settings;
        let expires_in = lifetime.as_secs().min(i32::MAX as u64) as i32;
        let done = self
            .exchange(link, KeyRequest::Temporary { dc_id: self.dc_id, expires_in })
            .await?;
        let expires_at = match done.auth_key.kind() {
            KeyKind::Temporary { expires_at, .. } => expires_at,
            KeyKind::Permanent => unix_now() + expires_in,
        };
        let temp_key = done
            .auth_key
            .with_kind(KeyKind::Temporary { expires_at, perm_key_id: perm_key.id() });

        let mut session = EncryptedSession::new(
            settings.crypto.clone(), temp_key.clone(), done.first_salt, done.time_offset,
        )
        .with_skew_window(settings.skew_window);

        let mut last_code = 0;
        for _ in 0..BIND_ATTEMPTS {
            let msg_id = session.allocate_msg_id();
            let call = auth::bind_temp_key(
                settings.crypto.as_ref(), perm_key, &temp_key, session.session_id(), msg_id, expires_at,
            );
            session.push_with_msg_id(msg_id, call.to_bytes(), true);
            let Some(out) = session.finalize() else { continue };
            link.send(&out.data).await?;

            let outcome = timeout(HANDSHAKE_STEP_TIMEOUT, await_bind(link, &mut session, msg_id))
                .await
                .map_err(|_| InvocationError::Timeout)??;
            match outcome {
                Ok(()) => {
                    tracing::info!("[ferry] DC{} temporary key bound until {expires_at}", self.dc_id);
                    return Ok(session);
                }
                Err(code) => last_code = code,
            }
        }
        Err(InvocationError::BadMessage { code: last_code })
    }

    // ── Serving ─────────────────────────────────────────────────────────────

    async fn serve(
        &mut self,
        mut link:    Link,
        mut session: EncryptedSession,
        shutdown:    &CancellationToken,
    ) -> End {
        let settings = self.settings.clone();
        let start = Instant::now();
        let mut keepalive = interval_at(start + settings.ping_interval, settings.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ack = interval_at(start + settings.ack_interval, settings.ack_interval);
        ack.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_recv = start;
        self.salts_request = None;

        if self.drain_commands() {
            return self.lost(End::Renew("auth key reset"), &session);
        }
        if let Err(e) = self.flush(&mut link, &mut session).await {
            return self.lost(End::Lost(e), &session);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.remember_salt(&session);
                    return End::Shutdown;
                }
                read = link.fill() => {
                    if let Err(e) = read {
                        return self.lost(End::Lost(e), &session);
                    }
                    last_recv = Instant::now();
                    loop {
                        let packet = match link.next_packet() {
                            Ok(Some(p)) => p,
                            Ok(None) => break,
                            Err(e) => return self.lost(End::Lost(e.into()), &session),
                        };
                        if let Err(e) = self.on_packet(packet, &mut session) {
                            return self.lost(End::Lost(e), &session);
                        }
                    }
                    if !self.queue.is_empty() || self.acks.len() >= settings.ack_threshold {
                        if let Err(e) = self.flush(&mut link, &mut session).await {
                            return self.lost(End::Lost(e), &session);
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        // Every handle is gone.
                        return End::Shutdown;
                    };
                    if self.accept(cmd) | self.drain_commands() {
                        return self.lost(End::Renew("auth key reset"), &session);
                    }
                    if let Err(e) = self.flush(&mut link, &mut session).await {
                        return self.lost(End::Lost(e), &session);
                    }
                }
                _ = keepalive.tick() => {
                    if last_recv.elapsed() > settings.ping_interval * 2 {
                        return self.lost(End::Lost(InvocationError::Timeout), &session);
                    }
                    if session.auth_key().is_expired(unix_now() + session.time_offset() + TEMP_KEY_MARGIN) {
                        return self.lost(End::Renew("temporary key expiring"), &session);
                    }
                    self.next_ping_id = self.next_ping_id.wrapping_add(1);
                    let ping = PingDelayDisconnect {
                        ping_id: self.next_ping_id,
                        disconnect_delay: (settings.ping_interval + DISCONNECT_GRACE).as_secs() as i32,
                    };
                    session.push(ping.to_bytes(), true);
                    if self.salts_request.is_none() && session.needs_future_salts(SystemTime::now()) {
                        self.salts_request = session.push(GetFutureSalts { num: FUTURE_SALTS }.to_bytes(), true);
                    }
                    if let Err(e) = self.flush(&mut link, &mut session).await {
                        return self.lost(End::Lost(e), &session);
                    }
                }
                _ = ack.tick() => {
                    self.purge_abandoned();
                    if !self.acks.is_empty() {
                        if let Err(e) = self.flush(&mut link, &mut session).await {
                            return self.lost(End::Lost(e), &session);
                        }
                    }
                }
            }
        }
    }

    /// Hand queued calls and acks to the session and write the frames.
    async fn flush(&mut self, link: &mut Link, session: &mut EncryptedSession) -> Result<(), InvocationError> {
        loop {
            if !self.acks.is_empty() {
                let body = MsgsAck { msg_ids: self.acks.clone() }.to_bytes();
                if session.push(body, false).is_some() {
                    self.acks.clear();
                }
            }
            while let Some(req) = self.queue.pop_front() {
                if req.reply.is_closed() {
                    continue;
                }
                match session.push(req.body.clone(), true) {
                    Some(msg_id) => {
                        self.pending.insert(msg_id, InFlight { request: req, container: None });
                    }
                    None => {
                        self.queue.push_front(req);
                        break;
                    }
                }
            }

            let Some(out) = session.finalize() else {
                return Ok(());
            };
            if out.msg_ids.len() > 1 {
                for id in &out.msg_ids {
                    if let Some(f) = self.pending.get_mut(id) {
                        f.container = Some(out.msg_id);
                    }
                }
            }
            tracing::trace!(
                "[ferry] DC{} sending {} message(s) as {}", self.dc_id, out.msg_ids.len(), out.msg_id.0
            );
            link.send(&out.data).await?;

            if self.queue.is_empty() && self.acks.is_empty() {
                return Ok(());
            }
        }
    }

    fn on_packet(&mut self, mut packet: Vec<u8>, session: &mut EncryptedSession) -> Result<(), InvocationError> {
        let envelope = match session.decrypt(&mut packet) {
            Ok(envelope) => envelope,
            Err(e @ DecryptError::OutOfWindow { .. }) => {
                tracing::warn!("[ferry] DC{} {e}; clock resynced, resending in a new session", self.dc_id);
                self.restart_session();
                self.remember_salt(session);
                return Ok(());
            }
            Err(e) if !e.is_fatal() => {
                tracing::debug!("[ferry] DC{} dropping message: {e}", self.dc_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Classified { events, acks } = session.classify(envelope);
        self.acks.extend(acks.into_iter().map(|id| id.0));
        for event in events {
            self.on_event(event);
        }
        Ok(())
    }

    fn on_event(&mut self, event: Inbound) {
        match event {
            Inbound::RpcResult { req_msg_id, body } => self.resolve(req_msg_id, Ok(body)),
            Inbound::RpcError { req_msg_id, error } => {
                self.resolve(req_msg_id, Err(InvocationError::Rpc(error.into())));
            }
            Inbound::Pong { msg_id, ping_id } => {
                // Keepalive pings are not in the table; explicit ones are.
                if self.pending.contains_key(&msg_id) {
                    self.resolve(msg_id, Ok(Pong { msg_id: msg_id.0, ping_id }.to_bytes()));
                }
            }
            Inbound::Ack { .. } => {}
            Inbound::BadMsg { bad_msg_id, code, session_reset } => {
                if session_reset {
                    tracing::info!("[ferry] DC{} session reset (code {code}), resending all", self.dc_id);
                    self.restart_session();
                } else if matches!(code, 16 | 17) {
                    self.requeue(|id, f| id == bad_msg_id || f.container == Some(bad_msg_id));
                } else {
                    tracing::warn!("[ferry] DC{} rejected {} with code {code}", self.dc_id, bad_msg_id.0);
                    self.fail(|id, f| id == bad_msg_id || f.container == Some(bad_msg_id), code);
                }
            }
            Inbound::BadSalt { bad_msg_id, .. } => {
                self.requeue(|id, f| id == bad_msg_id || f.container == Some(bad_msg_id));
            }
            Inbound::NewSession { first_msg_id } => {
                self.requeue(|id, _| id < first_msg_id);
            }
            Inbound::FutureSalts { req_msg_id } => {
                if self.salts_request == Some(req_msg_id) {
                    self.salts_request = None;
                }
            }
            Inbound::Update { msg_id, body } => {
                tracing::trace!("[ferry] DC{} unsolicited message {} ({} bytes)", self.dc_id, msg_id.0, body.len());
            }
        }
    }

    fn resolve(&mut self, msg_id: MessageId, result: Result<Vec<u8>, InvocationError>) {
        match self.pending.remove(&msg_id) {
            Some(f) => {
                let _ = f.request.reply.send(result);
            }
            None => tracing::debug!("[ferry] DC{} answer for unknown msg {}", self.dc_id, msg_id.0),
        }
    }

    fn take_pending(&mut self, pred: impl Fn(MessageId, &InFlight) -> bool) -> Vec<InFlight> {
        let ids: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(id, f)| pred(**id, f))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.pending.remove(&id)).collect()
    }

    /// Move matching in-flight calls back to the front of the queue, oldest first.
    fn requeue(&mut self, pred: impl Fn(MessageId, &InFlight) -> bool) {
        for f in self.take_pending(pred).into_iter().rev() {
            self.queue.push_front(f.request);
        }
    }

    /// The session was replaced: nothing sent in the old one will be answered.
    fn restart_session(&mut self) {
        self.acks.clear();
        self.salts_request = None;
        self.requeue(|_, _| true);
    }

    fn fail(&mut self, pred: impl Fn(MessageId, &InFlight) -> bool, code: i32) {
        for f in self.take_pending(pred) {
            let _ = f.request.reply.send(Err(InvocationError::BadMessage { code }));
        }
    }

    fn purge_abandoned(&mut self) {
        self.pending.retain(|_, f| !f.request.reply.is_closed());
        self.queue.retain(|r| !r.reply.is_closed());
    }

    /// Keep the latest salt and clock skew with the stored key.
    fn remember_salt(&self, session: &EncryptedSession) {
        if self.settings.temp_key_lifetime.is_some() {
            return;
        }
        self.key.send_modify(|key| {
            if let Some(key) = key {
                key.first_salt = session.salt();
                key.time_offset = session.time_offset();
            }
        });
    }

    /// Tear down the link: in-flight calls go back to the queue.
    fn lost(&mut self, end: End, session: &EncryptedSession) -> End {
        if let End::Lost(InvocationError::Transport(FrameError::Status { code: -404 })) = &end {
            if self.settings.temp_key_lifetime.is_none() {
                tracing::warn!("[ferry] DC{} does not know our auth key, dropping it", self.dc_id);
                self.key.send_replace(None);
            }
        }
        self.remember_salt(session);
        self.requeue(|_, _| true);
        end
    }
}

// ─── Handshake helpers ────────────────────────────────────────────────────────

async fn exchange_once(
    link:    &mut Link,
    crypto:  &dyn CryptoProvider,
    request: KeyRequest,
) -> Result<Finished, InvocationError> {
    let mut plain = Session::new();
    let (req, s1) = auth::step1(request);
    let res_pq = plain_call(link, &mut plain, &req).await?;
    let (req, s2) = auth::step2(crypto, s1, res_pq)?;
    let dh_params = plain_call(link, &mut plain, &req).await?;
    let (req, s3) = auth::step3(crypto, s2, dh_params)?;
    let answer = plain_call(link, &mut plain, &req).await?;
    Ok(auth::finish(crypto, s3, answer)?)
}

async fn plain_call<R: RemoteCall>(
    link:  &mut Link,
    plain: &mut Session,
    req:   &R,
) -> Result<R::Return, InvocationError> {
    link.send(&plain.pack(req).to_plaintext_bytes()).await?;
    let frame = timeout(HANDSHAKE_STEP_TIMEOUT, link.recv())
        .await
        .map_err(|_| InvocationError::Timeout)??;
    plain.unpack::<R>(&frame).map_err(|e| match e {
        UnpackError::Decode(e) => InvocationError::Deserialize(e),
        UnpackError::Frame(e) => {
            InvocationError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
        }
    })
}

/// Read until the bind call is answered. `Err(code)` means send it again.
async fn await_bind(
    link:    &mut Link,
    session: &mut EncryptedSession,
    msg_id:  MessageId,
) -> Result<Result<(), i32>, InvocationError> {
    loop {
        let mut packet = link.recv().await?;
        let envelope = match session.decrypt(&mut packet) {
            Ok(envelope) => envelope,
            // New clock, new session: send the bind again.
            Err(DecryptError::OutOfWindow { .. }) => return Ok(Err(16)),
            Err(e) if !e.is_fatal() => continue,
            Err(e) => return Err(e.into()),
        };
        for event in session.classify(envelope).events {
            match event {
                Inbound::RpcResult { req_msg_id, body } if req_msg_id == msg_id => {
                    return if bool::from_bytes(&body)? {
                        Ok(Ok(()))
                    } else {
                        Ok(Err(0))
                    };
                }
                Inbound::RpcError { req_msg_id, error } if req_msg_id == msg_id => {
                    return Err(InvocationError::Rpc(error.into()));
                }
                Inbound::BadMsg { bad_msg_id, code, .. } if bad_msg_id == msg_id => {
                    return Ok(Err(code));
                }
                Inbound::BadSalt { bad_msg_id, .. } if bad_msg_id == msg_id => {
                    return Ok(Err(48));
                }
                _ => {}
            }
        }
    }
}

fn unix_now() -> i32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i32
}
