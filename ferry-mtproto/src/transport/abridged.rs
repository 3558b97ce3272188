use super::{FrameError, PacketCodec, Unpacked, check_status};

/// [MTProto Abridged] framing: `0xef` once, then each packet is
/// `[length/4 as 1 or 4 bytes][payload]`.
///
/// [MTProto Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
#[derive(Debug, Default)]
pub struct Abridged {
    init_sent: bool,
}

impl Abridged {
    /// A codec for a fresh connection.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketCodec for Abridged {
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        debug_assert_eq!(payload.len() % 4, 0);
        if !self.init_sent {
            out.push(0xef);
            self.init_sent = true;
        }

        let words = payload.len() / 4;
        if words < 0x7f {
            out.push(words as u8);
        } else {
            out.push(0x7f);
            out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
        }
        out.extend_from_slice(payload);
    }

    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError> {
        let Some(&first) = buf.first() else {
            return Err(FrameError::MissingBytes);
        };

        let (header, words) = match first {
            0..0x7f => (1, first as usize),
            0x7f => {
                if buf.len() < 4 {
                    return Err(FrameError::MissingBytes);
                }
                (4, buf[1] as usize | (buf[2] as usize) << 8 | (buf[3] as usize) << 16)
            }
            _ => return Err(FrameError::BadLength { got: first as i32 }),
        };

        let end = header + words * 4;
        if buf.len() < end {
            return Err(FrameError::MissingBytes);
        }
        check_status(buf, Unpacked { data_start: header, data_end: end, next_offset: end })
    }

    fn obfuscated_tag(&self) -> Option<[u8; 4]> {
        Some([0xef; 4])
    }

    fn skip_preamble(&mut self) {
        self.init_sent = true;
    }

    fn reset(&mut self) {
        self.init_sent = false;
    }
}
