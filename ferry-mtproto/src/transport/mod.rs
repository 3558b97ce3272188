//! MTProto packet framing.
//!
//! Each [`PacketCodec`] turns encrypted (or plaintext handshake) payloads
//! into the byte layout of one [MTProto transport] and back. Codecs never
//! touch a socket: the connection feeds them whatever it has read and
//! writes whatever they produce.
//!
//! [MTProto transport]: https://core.telegram.org/mtproto/mtproto-transports

mod abridged;
mod full;
mod intermediate;
mod obfuscated;

pub use abridged::Abridged;
pub use full::Full;
pub use intermediate::{Intermediate, PaddedIntermediate};
pub use obfuscated::Obfuscated;

use std::fmt;

/// Where the payload of a packet sits inside the receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unpacked {
    /// First payload byte.
    pub data_start:  usize,
    /// One past the last payload byte.
    pub data_end:    usize,
    /// Where the next packet starts.
    pub next_offset: usize,
}

/// A packet could not be taken from the buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not hold a whole packet yet; read more and retry.
    MissingBytes,
    /// The length prefix is impossible.
    BadLength { got: i32 },
    /// The packet counter skipped (full transport).
    BadSeq { expected: i32, got: i32 },
    /// The checksum did not match (full transport).
    BadCrc { expected: u32, got: u32 },
    /// The server sent a transport error code instead of a packet
    /// (for example `-404` when it does not know the auth key).
    Status { code: i32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBytes => write!(f, "incomplete packet"),
            Self::BadLength { got } => write!(f, "bad packet length: {got}"),
            Self::BadSeq { expected, got } => {
                write!(f, "bad packet seq: expected {expected}, got {got}")
            }
            Self::BadCrc { expected, got } => {
                write!(f, "bad packet crc: expected {expected:#010x}, got {got:#010x}")
            }
            Self::Status { code } => write!(f, "transport error {code}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// One MTProto transport framing.
pub trait PacketCodec: Send {
    /// Append the framed `payload` to `out`.
    ///
    /// The first call on a fresh codec also writes the connection preamble.
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>);

    /// Locate the first packet in `buf`.
    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError>;

    /// Transform bytes as they arrive from the wire, before [`Self::unpack`].
    ///
    /// Each byte must be passed exactly once.
    fn deobfuscate(&mut self, _buf: &mut [u8]) {}

    /// Tag that announces this framing inside an obfuscated header, if it
    /// can be obfuscated at all.
    fn obfuscated_tag(&self) -> Option<[u8; 4]>;

    /// Do not write the preamble; another layer announces the framing.
    fn skip_preamble(&mut self);

    /// Forget all per-connection state.
    fn reset(&mut self);
}

impl PacketCodec for Box<dyn PacketCodec> {
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) { (**self).pack(payload, out) }
    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError> { (**self).unpack(buf) }
    fn deobfuscate(&mut self, buf: &mut [u8]) { (**self).deobfuscate(buf) }
    fn obfuscated_tag(&self) -> Option<[u8; 4]> { (**self).obfuscated_tag() }
    fn skip_preamble(&mut self) { (**self).skip_preamble() }
    fn reset(&mut self) { (**self).reset() }
}

/// A four-byte payload holding a negative integer is a transport error.
fn check_status(buf: &[u8], unpacked: Unpacked) -> Result<Unpacked, FrameError> {
    if unpacked.data_end - unpacked.data_start == 4 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[unpacked.data_start..unpacked.data_end]);
        let code = i32::from_le_bytes(word);
        if code < 0 {
            return Err(FrameError::Status { code });
        }
    }
    Ok(unpacked)
}
