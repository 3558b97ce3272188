//! # ferry-client
//!
//! Async MTProto 2.0 client engine on tokio.
//!
//! ## Features
//! - One long-lived connection per DC, opened lazily, reconnecting with backoff
//! - Auth key negotiation, optional temporary keys bound to the permanent one
//! - Concurrent calls multiplexed over one session, batched into containers
//! - `FLOOD_WAIT` auto-sleep and `*_MIGRATE_*` re-routing
//! - Cancellable calls with optional deadlines
//! - Pluggable transports, framings, crypto and session storage
//!
//! Application schemas are not part of this crate: anything implementing
//! [`ferry_tl::RemoteCall`] can be sent, and [`ferry_tl::RawRequest`] carries
//! pre-serialized bodies.
//!
//! ```rust,no_run
//! use ferry_client::{Client, Config};
//! use ferry_tl::mtproto::Ping;
//!
//! # async fn run() -> Result<(), ferry_client::InvocationError> {
//! let client = Client::connect(Config::default()).await?;
//! let pong = client.invoke(&Ping { ping_id: 7 }).await?;
//! assert_eq!(pong.ping_id, 7);
//! client.disconnect().await;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

pub mod connection;
mod dc_pool;
mod errors;
pub mod retry;
mod session;
pub mod session_backend;
pub mod socks5;
pub mod transport;

pub use connection::{Connection, ConnectionState, StoredKey};
pub use errors::{InvocationError, RpcError};
pub use ferry_mtproto::encrypted::SkewWindow;
pub use retry::{AutoSleep, Backoff, Decision, MigrateKind, NoRetries, RetryContext, RetryPolicy};
pub use session::{DcEntry, PersistedSession, default_dc_addresses};
pub use session_backend::{BinaryFileBackend, InMemoryBackend, SessionBackend};
#[cfg(feature = "sqlite-session")]
pub use session_backend::SqliteBackend;
pub use socks5::Socks5Config;
pub use transport::{AsyncStream, BoxStream, ConnectFuture, Connector, TcpConnector, TransportKind};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use ferry_crypto::{CryptoProvider, SoftwareCrypto};
use ferry_tl::{Deserializable, RemoteCall};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use connection::Settings;
use dc_pool::DcPool;

/// A call is re-routed at most this many times.
const MAX_MIGRATIONS: u32 = 3;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::connect`].
pub struct Config {
    /// DC id → `host:port`. Entries from a stored session take precedence.
    pub dc_addresses:          HashMap<i32, String>,
    /// DC used when no session is stored.
    pub home_dc_id:            i32,
    /// Which MTProto transport framing to use (default: Abridged).
    pub transport:             TransportKind,
    /// Optional SOCKS5 proxy for the default TCP connector.
    pub socks5:                Option<Socks5Config>,
    /// Replaces the default TCP connector entirely.
    pub connector:             Option<Arc<dyn Connector>>,
    pub crypto:                Arc<dyn CryptoProvider>,
    /// Session persistence backend (default: binary file `"ferry.session"`).
    pub session_backend:       Arc<dyn SessionBackend>,
    pub retry_policy:          Arc<dyn RetryPolicy>,
    /// Every `FLOOD_WAIT` up to this long is slept through and retried;
    /// longer ones are returned to the caller. `Duration::ZERO` returns all.
    pub flood_sleep_threshold: Duration,
    /// Reconnect delay curve.
    pub backoff:               Backoff,
    /// Accepted clock drift of server messages.
    pub skew_window:           SkewWindow,
    pub ping_interval:         Duration,
    pub ack_interval:          Duration,
    /// Pending acks that force an immediate flush.
    pub ack_threshold:         usize,
    /// Deadline for each attempt of a call, `None` to wait forever.
    pub request_timeout:       Option<Duration>,
    /// Key exchange attempts per connection attempt.
    pub handshake_attempts:    u32,
    /// When set, traffic is encrypted with temporary keys of this lifetime,
    /// bound to the stored permanent key.
    pub temp_key_lifetime:     Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dc_addresses:          default_dc_addresses(),
            home_dc_id:            2,
            transport:             TransportKind::Abridged,
            socks5:                None,
            connector:             None,
            crypto:                Arc::new(SoftwareCrypto::new()),
            session_backend:       Arc::new(BinaryFileBackend::new("ferry.session")),
            retry_policy:          Arc::new(AutoSleep::default()),
            flood_sleep_threshold: Duration::from_secs(60),
            backoff:               Backoff::default(),
            skew_window:           SkewWindow::default(),
            ping_interval:         Duration::from_secs(60),
            ack_interval:          Duration::from_millis(500),
            ack_threshold:         16,
            request_timeout:       None,
            handshake_attempts:    3,
            temp_key_lifetime:     None,
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    pool:                  Mutex<DcPool>,
    retry_policy:          Arc<dyn RetryPolicy>,
    flood_sleep_threshold: Duration,
    request_timeout:       Option<Duration>,
}

/// The client. Cheap to clone, internally Arc-wrapped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Load the stored session and start the home DC connection.
    ///
    /// Returns once the connection task is running; calls made before it is
    /// ready wait in its queue. A session that fails to load is logged and
    /// replaced by a fresh one.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        let connector = config.connector.unwrap_or_else(|| {
            let mut tcp = TcpConnector::default();
            if let Some(proxy) = config.socks5 {
                tcp = tcp.with_socks5(proxy);
            }
            Arc::new(tcp)
        });
        let settings = Arc::new(Settings {
            transport:          config.transport,
            connector,
            crypto:             config.crypto,
            backoff:            config.backoff,
            skew_window:        config.skew_window,
            ping_interval:      config.ping_interval,
            ack_interval:       config.ack_interval,
            ack_threshold:      config.ack_threshold.max(1),
            handshake_attempts: config.handshake_attempts,
            temp_key_lifetime:  config.temp_key_lifetime,
        });

        let backend = config.session_backend;
        let mut pool = DcPool::new(settings, config.dc_addresses, config.home_dc_id, backend.clone());
        match backend.load() {
            Ok(Some(session)) => {
                tracing::info!("[ferry] loaded session from {} (home DC{})", backend.name(), session.home_dc_id);
                pool.restore(session);
            }
            Ok(None) => tracing::info!("[ferry] no stored session, starting fresh"),
            Err(e) => tracing::warn!("[ferry] could not load session from {}: {e}", backend.name()),
        }

        let client = Self {
            inner: Arc::new(ClientInner {
                pool:                  Mutex::new(pool),
                retry_policy:          config.retry_policy,
                flood_sleep_threshold: config.flood_sleep_threshold,
                request_timeout:       config.request_timeout,
            }),
        };
        let home = client.home_dc_id().await;
        client.connection(home).await?;
        Ok(client)
    }

    async fn connection(&self, dc_id: i32) -> Result<Connection, InvocationError> {
        let (conn, fresh) = self.inner.pool.lock().await.connection(dc_id)?;
        if fresh {
            persist_key_changes(Arc::downgrade(&self.inner), &conn);
        }
        Ok(conn)
    }

    // ── Invoke ─────────────────────────────────────────────────────────────

    /// Invoke a request on the home DC, handling flood waits and migrations.
    pub async fn invoke<R: RemoteCall>(&self, req: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke_body(None, req.to_bytes()).await?;
        Ok(R::Return::from_bytes(&body)?)
    }

    /// Invoke a request on a specific DC.
    pub async fn invoke_on_dc<R: RemoteCall>(
        &self,
        dc_id: i32,
        req:   &R,
    ) -> Result<R::Return, InvocationError> {
        let body = self.invoke_body(Some(dc_id), req.to_bytes()).await?;
        Ok(R::Return::from_bytes(&body)?)
    }

    /// Start a call in the background.
    ///
    /// The returned handle resolves like [`Self::invoke`]; dropping it or
    /// calling [`CallHandle::cancel`] abandons the call.
    pub fn call<R: RemoteCall>(&self, req: &R) -> CallHandle<R> {
        self.spawn_call(req.to_bytes(), None)
    }

    /// [`Self::call`] that fails with [`InvocationError::Timeout`] after `deadline`.
    pub fn call_with_timeout<R: RemoteCall>(&self, req: &R, deadline: Duration) -> CallHandle<R> {
        self.spawn_call(req.to_bytes(), Some(deadline))
    }

    /// Stop waiting for `handle`. It resolves to [`InvocationError::Cancelled`].
    pub fn cancel<R: RemoteCall>(&self, handle: &CallHandle<R>) {
        handle.cancel();
    }

    fn spawn_call<R: RemoteCall>(&self, body: Vec<u8>, deadline: Option<Duration>) -> CallHandle<R> {
        let client = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let work = async {
                match deadline {
                    Some(d) => timeout(d, client.invoke_body(None, body))
                        .await
                        .unwrap_or(Err(InvocationError::Timeout)),
                    None => client.invoke_body(None, body).await,
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(InvocationError::Cancelled),
                r = work => r,
            }
        });
        CallHandle { task, cancel, _marker: PhantomData }
    }

    async fn invoke_body(&self, dc: Option<i32>, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        let mut target = dc;
        let mut migrations = 0;
        let mut fail_count = NonZeroU32::MIN;
        let mut slept_so_far = Duration::default();

        loop {
            let dc_id = match target {
                Some(dc_id) => dc_id,
                None => self.home_dc_id().await,
            };
            let conn = self.connection(dc_id).await?;
            let result = match self.inner.request_timeout {
                Some(t) => timeout(t, conn.invoke_raw(body.clone()))
                    .await
                    .unwrap_or(Err(InvocationError::Timeout)),
                None => conn.invoke_raw(body.clone()).await,
            };
            let error = match result {
                Ok(answer) => return Ok(answer),
                Err(e) => e,
            };

            match retry::classify(&error) {
                Decision::Migrate { kind, dc } if migrations < MAX_MIGRATIONS => {
                    migrations += 1;
                    tracing::info!("[ferry] {kind:?} migration: DC{dc_id} → DC{dc}");
                    if kind.moves_home() {
                        let mut pool = self.inner.pool.lock().await;
                        pool.set_home_dc(dc);
                        if let Err(e) = pool.save() {
                            tracing::warn!("[ferry] could not persist home DC: {e}");
                        }
                    }
                    target = Some(dc);
                    continue;
                }
                Decision::Migrate { .. } => return Err(error),
                Decision::FloodWait(wait) if wait > self.inner.flood_sleep_threshold => {
                    return Err(error);
                }
                Decision::FloodWait(wait) => {
                    tracing::info!("[ferry] flood wait of {wait:?} on DC{dc_id}, sleeping before retry");
                    sleep(wait).await;
                    slept_so_far += wait;
                    continue;
                }
                Decision::Surface => {}
            }

            let ctx = RetryContext { fail_count, slept_so_far, error };
            match self.inner.retry_policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Err(ctx.error),
            }
        }
    }

    // ── Session & DCs ──────────────────────────────────────────────────────

    pub async fn home_dc_id(&self) -> i32 {
        self.inner.pool.lock().await.home_dc_id()
    }

    /// Persist keys, salts and the DC table through the session backend.
    pub async fn save_session(&self) -> io::Result<()> {
        self.inner.pool.lock().await.save()
    }

    /// Current keys, salts and the DC table, without saving them.
    pub async fn session(&self) -> PersistedSession {
        self.inner.pool.lock().await.snapshot()
    }

    /// Drop the auth key of `dc_id` and negotiate a new one.
    pub async fn reset_auth_key(&self, dc_id: i32) {
        self.inner.pool.lock().await.reset_auth_key(dc_id);
    }

    /// Change the address of `dc_id`, reconnecting if it is in use.
    pub async fn set_dc_address(&self, dc_id: i32, addr: impl Into<String>) {
        self.inner.pool.lock().await.update_addr(dc_id, addr.into());
    }

    /// State of the connection to `dc_id`, if one was opened.
    pub async fn connection_state(&self, dc_id: i32) -> Option<ConnectionState> {
        self.inner.pool.lock().await.state(dc_id)
    }

    /// Close every connection and save the session.
    ///
    /// Calls still waiting fail with [`InvocationError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let conns = self.inner.pool.lock().await.close();
        for conn in &conns {
            conn.closed().await;
        }
        if let Err(e) = self.save_session().await {
            tracing::warn!("[ferry] could not save session on disconnect: {e}");
        }
        tracing::info!("[ferry] disconnected");
    }
}

/// Save the session whenever `conn` gets a new key, until either side is gone.
fn persist_key_changes(inner: Weak<ClientInner>, conn: &Connection) {
    let mut keys = conn.watch_key();
    let dc_id = conn.dc_id();
    tokio::spawn(async move {
        let mut known = keys.borrow_and_update().as_ref().map(|k| k.auth_key);
        while keys.changed().await.is_ok() {
            let current = keys.borrow_and_update().as_ref().map(|k| k.auth_key);
            if current == known {
                continue;
            }
            known = current;
            let Some(inner) = inner.upgrade() else { break };
            if let Err(e) = inner.pool.lock().await.save() {
                tracing::warn!("[ferry] could not save new key for DC{dc_id}: {e}");
            }
        }
    });
}

// ─── CallHandle ───────────────────────────────────────────────────────────────

/// A call running in the background. Await it for the answer.
pub struct CallHandle<R: RemoteCall> {
    task:    JoinHandle<Result<Vec<u8>, InvocationError>>,
    cancel:  CancellationToken,
    _marker: PhantomData<fn() -> R>,
}

impl<R: RemoteCall> CallHandle<R> {
    /// Stop waiting. The request itself may already be on the wire.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<R: RemoteCall> Future for CallHandle<R> {
    type Output = Result<R::Return, InvocationError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(body))) => Poll::Ready(R::Return::from_bytes(&body).map_err(Into::into)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(InvocationError::Cancelled)),
        }
    }
}

impl<R: RemoteCall> Drop for CallHandle<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
