use crc32fast::Hasher;

use super::{FrameError, PacketCodec, Unpacked, check_status};

/// [MTProto Full] framing: no preamble; each packet is
/// `[len][seq][payload][crc32]`, where `len` counts the whole packet and
/// the CRC covers everything before it.
///
/// [MTProto Full]: https://core.telegram.org/mtproto/mtproto-transports#full
#[derive(Debug, Default)]
pub struct Full {
    send_seq: i32,
    recv_seq: i32,
}

impl Full {
    /// A codec for a fresh connection.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketCodec for Full {
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        let len = (payload.len() + 4 + 4 + 4) as i32;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.send_seq.to_le_bytes());
        out.extend_from_slice(payload);

        let mut hasher = Hasher::new();
        hasher.update(&out[start..]);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());

        self.send_seq += 1;
    }

    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError> {
        if buf.len() < 4 {
            return Err(FrameError::MissingBytes);
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[..4]);
        let len = i32::from_le_bytes(word);
        if len < 12 {
            return Err(FrameError::BadLength { got: len });
        }
        let len = len as usize;
        if buf.len() < len {
            return Err(FrameError::MissingBytes);
        }

        word.copy_from_slice(&buf[4..8]);
        let seq = i32::from_le_bytes(word);
        if seq != self.recv_seq {
            return Err(FrameError::BadSeq { expected: self.recv_seq, got: seq });
        }

        word.copy_from_slice(&buf[len - 4..len]);
        let got = u32::from_le_bytes(word);
        let mut hasher = Hasher::new();
        hasher.update(&buf[..len - 4]);
        let expected = hasher.finalize();
        if got != expected {
            return Err(FrameError::BadCrc { expected, got });
        }

        self.recv_seq += 1;
        check_status(buf, Unpacked { data_start: 8, data_end: len - 4, next_offset: len })
    }

    fn obfuscated_tag(&self) -> Option<[u8; 4]> {
        None
    }

    fn skip_preamble(&mut self) {}

    fn reset(&mut self) {
        self.send_seq = 0;
        self.recv_seq = 0;
    }
}
