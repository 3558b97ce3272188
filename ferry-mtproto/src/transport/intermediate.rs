use super::{FrameError, PacketCodec, Unpacked, check_status};

/// [MTProto Intermediate] framing: `0xeeeeeeee` once, then each packet is
/// `[4-byte LE length][payload]`.
///
/// [MTProto Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
#[derive(Debug, Default)]
pub struct Intermediate {
    init_sent: bool,
}

impl Intermediate {
    /// A codec for a fresh connection.
    pub fn new() -> Self {
        Self::default()
    }
}

fn unpack_length_prefixed(buf: &[u8]) -> Result<Unpacked, FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::MissingBytes);
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[..4]);
    let len = i32::from_le_bytes(word);
    if len < 0 {
        return Err(FrameError::BadLength { got: len });
    }
    let end = 4 + len as usize;
    if buf.len() < end {
        return Err(FrameError::MissingBytes);
    }
    check_status(buf, Unpacked { data_start: 4, data_end: end, next_offset: end })
}

impl PacketCodec for Intermediate {
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        if !self.init_sent {
            out.extend_from_slice(&[0xee; 4]);
            self.init_sent = true;
        }
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError> {
        unpack_length_prefixed(buf)
    }

    fn obfuscated_tag(&self) -> Option<[u8; 4]> {
        Some([0xee; 4])
    }

    fn skip_preamble(&mut self) {
        self.init_sent = true;
    }

    fn reset(&mut self) {
        self.init_sent = false;
    }
}

/// [Padded intermediate] framing: like [`Intermediate`] with preamble
/// `0xdddddddd` and 0..=15 random bytes after each payload.
///
/// Required by MTProxy secrets starting with `dd`. Receivers drop the
/// padding when they cut the ciphertext to whole AES blocks.
///
/// [Padded intermediate]: https://core.telegram.org/mtproto/mtproto-transports#padded-intermediate
#[derive(Debug, Default)]
pub struct PaddedIntermediate {
    init_sent: bool,
}

impl PaddedIntermediate {
    /// A codec for a fresh connection.
    pub fn new() -> Self {
        Self::default()
    }

    fn pack_with_padding(&mut self, payload: &[u8], padding: &[u8], out: &mut Vec<u8>) {
        if !self.init_sent {
            out.extend_from_slice(&[0xdd; 4]);
            self.init_sent = true;
        }
        out.extend_from_slice(&((payload.len() + padding.len()) as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(padding);
    }
}

impl PacketCodec for PaddedIntermediate {
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let mut rnd = [0u8; 16];
        getrandom::getrandom(&mut rnd).expect("getrandom");
        let pad = (rnd[0] & 0x0f) as usize;
        self.pack_with_padding(payload, &rnd[1..1 + pad], out);
    }

    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError> {
        unpack_length_prefixed(buf)
    }

    fn obfuscated_tag(&self) -> Option<[u8; 4]> {
        Some([0xdd; 4])
    }

    fn skip_preamble(&mut self) {
        self.init_sent = true;
    }

    fn reset(&mut self) {
        self.init_sent = false;
    }
}
