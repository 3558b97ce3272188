use std::sync::Arc;

use ferry_crypto::{CryptoProvider, CtrCipher};

use super::{FrameError, PacketCodec, Unpacked};

// First words a client may not start with: they would look like HTTP,
// TLS or another transport's preamble.
const FORBIDDEN_STARTS: [[u8; 4]; 7] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0x16, 0x03, 0x01, 0x02],
    [0xdd; 4],
    [0xee; 4],
];

/// [MTProto Obfuscated2] over an inner framing.
///
/// A 64-byte random header announces the inner framing and seeds two
/// AES-256-CTR streams; every byte after it is encrypted in both
/// directions. With an MTProxy secret the keys are mixed with the secret
/// and the target DC travels in the header.
///
/// [MTProto Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation
pub struct Obfuscated<C> {
    inner:  C,
    header: Option<[u8; 64]>,
    tx:     Box<dyn CtrCipher>,
    rx:     Box<dyn CtrCipher>,
}

impl<C: PacketCodec> Obfuscated<C> {
    /// Wrap `inner` with a freshly generated header.
    ///
    /// Returns `None` if `inner` cannot be obfuscated.
    pub fn new(
        inner:  C,
        crypto: &dyn CryptoProvider,
        secret: Option<[u8; 16]>,
        dc_id:  i16,
    ) -> Option<Self> {
        let tag = inner.obfuscated_tag()?;
        let mut init = [0u8; 64];
        loop {
            getrandom::getrandom(&mut init).expect("getrandom");
            if is_valid_init(&init) {
                break;
            }
        }
        init[56..60].copy_from_slice(&tag);
        init[60..62].copy_from_slice(&dc_id.to_le_bytes());
        Self::with_init(inner, crypto, secret, init)
    }

    /// Wrap `inner` using a caller-provided header.
    ///
    /// Bytes 56..60 are overwritten with the inner framing's tag.
    pub fn with_init(
        mut inner: C,
        crypto:    &dyn CryptoProvider,
        secret:    Option<[u8; 16]>,
        mut init:  [u8; 64],
    ) -> Option<Self> {
        let tag = inner.obfuscated_tag()?;
        init[56..60].copy_from_slice(&tag);
        inner.skip_preamble();

        let mut reversed = init;
        reversed.reverse();

        let derive = |seed: &[u8; 64]| -> ([u8; 32], [u8; 16]) {
            let mut key = [0u8; 32];
            key.copy_from_slice(&seed[8..40]);
            if let Some(secret) = secret {
                key = crypto.sha256(&[&key[..], &secret[..]]);
            }
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&seed[40..56]);
            (key, iv)
        };

        let (tx_key, tx_iv) = derive(&init);
        let (rx_key, rx_iv) = derive(&reversed);
        let mut tx = crypto.ctr_cipher(&tx_key, &tx_iv);
        let rx = crypto.ctr_cipher(&rx_key, &rx_iv);

        // Only the tail of the header is sent encrypted, but the keystream
        // advances over all 64 bytes.
        let mut encrypted = init;
        tx.apply(&mut encrypted);
        let mut header = init;
        header[56..].copy_from_slice(&encrypted[56..]);

        Some(Self { inner, header: Some(header), tx, rx })
    }
}

fn is_valid_init(init: &[u8; 64]) -> bool {
    init[0] != 0xef
        && !FORBIDDEN_STARTS.iter().any(|start| init[..4] == start[..])
        && init[4..8] != [0; 4]
}

impl<C: PacketCodec> PacketCodec for Obfuscated<C> {
    fn pack(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        if let Some(header) = self.header.take() {
            out.extend_from_slice(&header);
        }
        let start = out.len();
        self.inner.pack(payload, out);
        self.tx.apply(&mut out[start..]);
    }

    fn unpack(&mut self, buf: &[u8]) -> Result<Unpacked, FrameError> {
        self.inner.unpack(buf)
    }

    fn deobfuscate(&mut self, buf: &mut [u8]) {
        self.rx.apply(buf);
    }

    fn obfuscated_tag(&self) -> Option<[u8; 4]> {
        None
    }

    fn skip_preamble(&mut self) {}

    // The ciphers cannot be rewound: a new connection needs a new codec.
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Abridged, Full, PaddedIntermediate};
    use ferry_crypto::SoftwareCrypto;

    fn init() -> [u8; 64] {
        std::array::from_fn(|i| (i as u8).wrapping_mul(7).wrapping_add(1))
    }

    fn server_ciphers(init: &[u8; 64], secret: Option<[u8; 16]>) -> (Box<dyn CtrCipher>, Box<dyn CtrCipher>) {
        let crypto = SoftwareCrypto::new();
        let mut reversed = *init;
        reversed.reverse();
        let key = |seed: &[u8; 64]| {
            let mut key: [u8; 32] = seed[8..40].try_into().unwrap();
            if let Some(secret) = secret {
                key = crypto.sha256(&[&key[..], &secret[..]]);
            }
            let iv: [u8; 16] = seed[40..56].try_into().unwrap();
            (key, iv)
        };
        let (k, iv) = key(init);
        let from_client = crypto.ctr_cipher(&k, &iv);
        let (k, iv) = key(&reversed);
        let to_client = crypto.ctr_cipher(&k, &iv);
        (from_client, to_client)
    }

    fn roundtrip(secret: Option<[u8; 16]>) {
        let crypto = SoftwareCrypto::new();
        let mut client = Obfuscated::with_init(Abridged::new(), &crypto, secret, init()).unwrap();

        let mut wire = Vec::new();
        client.pack(&[1, 2, 3, 4, 5, 6, 7, 8], &mut wire);
        assert_eq!(wire.len(), 64 + 1 + 8);
        assert_eq!(&wire[..56], &init()[..56]);

        // The server decrypts the whole header to recover the tag.
        let (mut from_client, mut to_client) = server_ciphers(&init(), secret);
        let mut plain = wire.clone();
        from_client.apply(&mut plain);
        assert_eq!(&plain[56..60], &[0xef; 4]);
        assert_eq!(&plain[64..], &[2, 1, 2, 3, 4, 5, 6, 7, 8]);

        // And answers through the reversed-key stream.
        let mut reply = vec![1, 0xaa, 0xbb, 0xcc, 0xdd];
        to_client.apply(&mut reply);
        client.deobfuscate(&mut reply);
        let unpacked = client.unpack(&reply).unwrap();
        assert_eq!(&reply[unpacked.data_start..unpacked.data_end], &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn roundtrip_without_secret() {
        roundtrip(None);
    }

    #[test]
    fn roundtrip_with_secret() {
        roundtrip(Some([0x42; 16]));
    }

    #[test]
    fn secret_changes_the_stream() {
        let crypto = SoftwareCrypto::new();
        let mut plain = Obfuscated::with_init(Abridged::new(), &crypto, None, init()).unwrap();
        let mut mixed = Obfuscated::with_init(Abridged::new(), &crypto, Some([1; 16]), init()).unwrap();
        let (mut a, mut b) = (Vec::new(), Vec::new());
        plain.pack(&[0; 4], &mut a);
        mixed.pack(&[0; 4], &mut b);
        assert_ne!(a[56..], b[56..]);
    }

    #[test]
    fn generated_headers_are_valid() {
        let crypto = SoftwareCrypto::new();
        for _ in 0..16 {
            let mut codec = Obfuscated::new(PaddedIntermediate::new(), &crypto, None, -2).unwrap();
            let mut wire = Vec::new();
            codec.pack(&[0; 4], &mut wire);
            let header: [u8; 64] = wire[..64].try_into().unwrap();
            assert!(is_valid_init(&header));
        }
    }

    #[test]
    fn full_cannot_be_obfuscated() {
        assert!(Obfuscated::new(Full::new(), &SoftwareCrypto::new(), None, 2).is_none());
    }

    #[test]
    fn forbidden_starts_are_refused() {
        assert!(is_valid_init(&init()));

        let mut bad = init();
        bad[..4].copy_from_slice(b"POST");
        assert!(!is_valid_init(&bad));

        let mut bad = init();
        bad[4..8].copy_from_slice(&[0; 4]);
        assert!(!is_valid_init(&bad));

        let mut bad = init();
        bad[0] = 0xef;
        assert!(!is_valid_init(&bad));
    }
}
