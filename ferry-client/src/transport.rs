//! Byte-stream transports and packet framing selection.
//!
//! A [`Connector`] opens a bidirectional stream to a DC address; the
//! connection task never knows whether that is plain TCP, a SOCKS5 tunnel
//! or an in-memory pipe. [`TransportKind`] picks the MTProto framing laid
//! over it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use ferry_crypto::CryptoProvider;
use ferry_mtproto::transport::{
    Abridged, Full, Intermediate, Obfuscated, PacketCodec, PaddedIntermediate,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::socks5::Socks5Config;

// ─── Streams ──────────────────────────────────────────────────────────────────

/// Anything a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An owned, type-erased stream.
pub type BoxStream = Box<dyn AsyncStream>;

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send + 'a>>;

/// Opens streams to DC addresses.
pub trait Connector: Send + Sync {
    /// Open a stream to `addr` (`host:port`).
    fn connect<'a>(&'a self, addr: &'a str) -> ConnectFuture<'a>;
}

// ─── TcpConnector ─────────────────────────────────────────────────────────────

/// Plain TCP, optionally through a SOCKS5 proxy.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    socks5:          Option<Socks5Config>,
    connect_timeout: Duration,
    keepalive:       Option<Duration>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            socks5:          None,
            connect_timeout: Duration::from_secs(10),
            keepalive:       Some(Duration::from_secs(30)),
        }
    }
}

impl TcpConnector {
    /// Tunnel every connection through `proxy`.
    pub fn with_socks5(mut self, proxy: Socks5Config) -> Self {
        self.socks5 = Some(proxy);
        self
    }

    /// Give up on a connection attempt after `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// TCP keepalive idle time, or `None` to leave the OS default.
    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    async fn open(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = match &self.socks5 {
            Some(proxy) => proxy.connect(addr).await?,
            None        => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(stream)
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, addr: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.connect_timeout, self.open(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
            tracing::debug!("[ferry] TCP connected to {addr}");
            Ok(Box::new(stream) as BoxStream)
        })
    }
}

// ─── TransportKind ────────────────────────────────────────────────────────────

/// Which MTProto transport framing to use for all connections.
///
/// | Variant | Init bytes | Notes |
/// |---------|-----------|-------|
/// | `Abridged` | `0xef` | Default, smallest overhead |
/// | `Intermediate` | `0xeeeeeeee` | Better proxy compat |
/// | `PaddedIntermediate` | `0xdddddddd` | Random padding hides packet sizes |
/// | `Full` | none | Adds seqno + CRC32 |
/// | `Obfuscated` | random 64B | Bypasses DPI / MTProxy |
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// [Abridged]: length prefix is 1 or 4 bytes.
    ///
    /// [Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
    #[default]
    Abridged,
    /// [Intermediate]: 4-byte LE length prefix.
    ///
    /// [Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
    Intermediate,
    /// [Padded intermediate]: intermediate plus 0..15 random bytes per packet.
    ///
    /// [Padded intermediate]: https://core.telegram.org/mtproto/mtproto-transports#padded-intermediate
    PaddedIntermediate,
    /// [Full]: 4-byte length + seqno + CRC32.
    ///
    /// [Full]: https://core.telegram.org/mtproto/mtproto-transports#full
    Full,
    /// [Obfuscated2]: AES-CTR over abridged framing, or over padded
    /// intermediate when an MTProxy `secret` is given.
    ///
    /// [Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation
    Obfuscated { secret: Option<[u8; 16]> },
}

impl TransportKind {
    /// A fresh codec for one connection to `dc_id`.
    pub fn codec(&self, crypto: &dyn CryptoProvider, dc_id: i32) -> Box<dyn PacketCodec> {
        match self {
            Self::Abridged           => Box::new(Abridged::new()),
            Self::Intermediate       => Box::new(Intermediate::new()),
            Self::PaddedIntermediate => Box::new(PaddedIntermediate::new()),
            Self::Full               => Box::new(Full::new()),
            Self::Obfuscated { secret } => {
                let inner: Box<dyn PacketCodec> = match secret {
                    Some(_) => Box::new(PaddedIntermediate::new()),
                    None    => Box::new(Abridged::new()),
                };
                match Obfuscated::new(inner, crypto, *secret, dc_id as i16) {
                    Some(codec) => Box::new(codec),
                    None => {
                        tracing::warn!("[ferry] framing cannot be obfuscated, using abridged");
                        Box::new(Abridged::new())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_crypto::SoftwareCrypto;

    fn first_packet(kind: TransportKind) -> Vec<u8> {
        let mut codec = kind.codec(&SoftwareCrypto::new(), 2);
        let mut out = Vec::new();
        codec.pack(&[0u8; 8], &mut out);
        out
    }

    #[test]
    fn each_kind_writes_its_preamble() {
        assert_eq!(first_packet(TransportKind::Abridged)[0], 0xef);
        assert_eq!(&first_packet(TransportKind::Intermediate)[..4], &[0xee; 4]);
        assert_eq!(&first_packet(TransportKind::PaddedIntermediate)[..4], &[0xdd; 4]);
        // Full has no preamble: the packet starts with its length (8 + 12).
        assert_eq!(&first_packet(TransportKind::Full)[..4], &20u32.to_le_bytes());
    }

    #[test]
    fn obfuscated_starts_with_a_random_header() {
        let a = first_packet(TransportKind::Obfuscated { secret: None });
        let b = first_packet(TransportKind::Obfuscated { secret: Some([1; 16]) });
        assert!(a.len() > 64 && b.len() > 64);
        assert_ne!(a[..56], b[..56]);
        assert_ne!(a[0], 0xef);
    }

    #[tokio::test]
    async fn tcp_connector_reaches_a_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpConnector::default().with_connect_timeout(Duration::from_secs(2));
        assert!(connector.connect(&addr).await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
