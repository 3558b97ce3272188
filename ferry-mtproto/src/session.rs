//! Plaintext MTProto session, used only while negotiating an auth key.

use ferry_tl::{Deserializable, RemoteCall, Serializable};

use crate::message::{Message, MessageIdGenerator, PlainError};

/// Tracks message ids for unencrypted handshake traffic.
///
/// A `Session` is cheap to create and is discarded once the auth key exists.
///
/// # Example
///
/// ```rust
/// use ferry_mtproto::Session;
/// use ferry_tl::mtproto::ReqPqMulti;
///
/// let mut session = Session::new();
/// let msg = session.pack(&ReqPqMulti { nonce: [0; 16] });
/// assert_eq!(&msg.to_plaintext_bytes()[..8], &[0; 8]);
/// ```
#[derive(Debug, Default)]
pub struct Session {
    ids: MessageIdGenerator,
}

/// A plaintext response could not be read.
#[derive(Clone, Debug, PartialEq)]
pub enum UnpackError {
    /// The frame itself was malformed.
    Frame(PlainError),
    /// The body did not decode as the expected response.
    Decode(ferry_tl::DecodeError),
}

impl std::fmt::Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "plaintext frame: {e}"),
            Self::Decode(e) => write!(f, "plaintext body: {e}"),
        }
    }
}

impl std::error::Error for UnpackError {}

impl Session {
    /// Create a fresh session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize an RPC function into a [`Message`] ready to send.
    ///
    /// The surrounding framing (auth_key_id = 0, length) is applied by
    /// [`Message::to_plaintext_bytes`].
    pub fn pack<R: RemoteCall>(&mut self, call: &R) -> Message {
        Message::plaintext(self.ids.next(), call.to_bytes())
    }

    /// Parse a plaintext frame and decode its body as `R::Return`.
    pub fn unpack<R: RemoteCall>(&self, frame: &[u8]) -> Result<R::Return, UnpackError> {
        let message = Message::from_plaintext_bytes(frame).map_err(UnpackError::Frame)?;
        R::Return::from_bytes(&message.body).map_err(UnpackError::Decode)
    }
}
