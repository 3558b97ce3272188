//! Error types for ferry-client.

use std::{fmt, io};

use ferry_mtproto::authentication;
use ferry_mtproto::transport::FrameError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    ///
    /// The numeric part may also sit in the middle, as in
    /// `"FLOOD_PREMIUM_WAIT_5"` or `"PHONE_MIGRATE_2"`; only a trailing
    /// number is extracted.
    pub fn from_server(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_MIGRATE")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Returns the flood-wait duration in seconds, if this is a FLOOD_WAIT error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && (self.name == "FLOOD_WAIT" || self.name == "FLOOD_PREMIUM_WAIT") {
            self.value.map(|v| v as u64)
        } else {
            None
        }
    }
}

impl From<ferry_tl::mtproto::RpcError> for RpcError {
    fn from(e: ferry_tl::mtproto::RpcError) -> Self {
        Self::from_server(e.error_code, &e.error_message)
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from any `Client` method that talks to a server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// Response deserialization failed.
    Deserialize(ferry_tl::DecodeError),
    /// No auth key could be negotiated within the configured attempts.
    KeyExchange(authentication::Error),
    /// A server frame failed verification; the connection is reset.
    Integrity(ferry_mtproto::DecryptError),
    /// The server refused the message with a `bad_msg_notification`.
    BadMessage { code: i32 },
    /// The call's deadline passed before an answer arrived.
    Timeout,
    /// The connection was shut down before an answer arrived.
    ConnectionClosed,
    /// The caller gave up on the call.
    Cancelled,
    /// The packet layer rejected the stream or reported a transport error.
    Transport(FrameError),
    /// No address is known for the requested DC.
    UnknownDc(i32),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)               => write!(f, "{e}"),
            Self::Io(e)                => write!(f, "I/O error: {e}"),
            Self::Deserialize(e)       => write!(f, "deserialize error: {e}"),
            Self::KeyExchange(e)       => write!(f, "key exchange failed: {e}"),
            Self::Integrity(e)         => write!(f, "integrity check failed: {e}"),
            Self::BadMessage { code }  => write!(f, "bad message (code {code})"),
            Self::Timeout              => write!(f, "request timed out"),
            Self::ConnectionClosed     => write!(f, "connection closed"),
            Self::Cancelled            => write!(f, "request cancelled"),
            Self::Transport(e)         => write!(f, "transport error: {e}"),
            Self::UnknownDc(dc)        => write!(f, "no address known for DC{dc}"),
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e)         => Some(e),
            Self::Io(e)          => Some(e),
            Self::Deserialize(e) => Some(e),
            Self::KeyExchange(e) => Some(e),
            Self::Integrity(e)   => Some(e),
            Self::Transport(e)   => Some(e),
            _                    => None,
        }
    }
}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<ferry_tl::DecodeError> for InvocationError {
    fn from(e: ferry_tl::DecodeError) -> Self { Self::Deserialize(e) }
}

impl From<authentication::Error> for InvocationError {
    fn from(e: authentication::Error) -> Self { Self::KeyExchange(e) }
}

impl From<ferry_mtproto::DecryptError> for InvocationError {
    fn from(e: ferry_mtproto::DecryptError) -> Self { Self::Integrity(e) }
}

impl From<FrameError> for InvocationError {
    fn from(e: FrameError) -> Self { Self::Transport(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a FLOOD_WAIT error, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }

    /// A copy suitable for handing to several waiters.
    ///
    /// `io::Error` is not `Clone`, so its kind and message are carried over.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Rpc(e)              => Self::Rpc(e.clone()),
            Self::Io(e)               => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Deserialize(e)      => Self::Deserialize(e.clone()),
            Self::KeyExchange(e)      => Self::KeyExchange(e.clone()),
            Self::Integrity(e)        => Self::Integrity(e.clone()),
            Self::BadMessage { code } => Self::BadMessage { code: *code },
            Self::Timeout             => Self::Timeout,
            Self::ConnectionClosed    => Self::ConnectionClosed,
            Self::Cancelled           => Self::Cancelled,
            Self::Transport(e)        => Self::Transport(e.clone()),
            Self::UnknownDc(dc)       => Self::UnknownDc(*dc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffix_is_split_off() {
        let e = RpcError::from_server(420, "FLOOD_WAIT_30");
        assert_eq!(e.name, "FLOOD_WAIT");
        assert_eq!(e.value, Some(30));
        assert_eq!(e.flood_wait_seconds(), Some(30));

        let e = RpcError::from_server(400, "PEER_ID_INVALID");
        assert_eq!(e.name, "PEER_ID_INVALID");
        assert_eq!(e.value, None);
        assert_eq!(e.flood_wait_seconds(), None);
    }

    #[test]
    fn wildcard_matching() {
        let e = RpcError::from_server(303, "PHONE_MIGRATE_4");
        assert!(e.is("PHONE_MIGRATE"));
        assert!(e.is("PHONE_*"));
        assert!(e.is("*_MIGRATE"));
        assert!(!e.is("FILE_*"));
        assert!(InvocationError::Rpc(e).is("*_MIGRATE"));
        assert!(!InvocationError::Timeout.is("*"));
    }

    #[test]
    fn converts_wire_errors() {
        let wire = ferry_tl::mtproto::RpcError { error_code: 420, error_message: "FLOOD_WAIT_5".into() };
        let e = RpcError::from(wire);
        assert_eq!(e, RpcError { code: 420, name: "FLOOD_WAIT".into(), value: Some(5) });
    }

    #[test]
    fn duplicate_keeps_io_kind() {
        let e = InvocationError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        match e.duplicate() {
            InvocationError::Io(d) => assert_eq!(d.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected {other:?}"),
        }
    }
}
