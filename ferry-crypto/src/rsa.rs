//! RSA padding used by Telegram's auth key exchange.

use num_bigint::BigUint;
use crate::{aes, sha1, sha256};

/// An RSA public key (n, e).
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    /// The server-side fingerprint: the low 64 bits of
    /// `SHA1(bytes(n) ‖ bytes(e))`, both TL-encoded big-endian `bytes`.
    pub fn fingerprint(&self) -> i64 {
        let sha = sha1!(tl_bytes(&self.n.to_bytes_be()), tl_bytes(&self.e.to_bytes_be()));
        let mut low = [0u8; 8];
        low.copy_from_slice(&sha[12..20]);
        i64::from_le_bytes(low)
    }
}

fn tl_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    if data.len() <= 253 {
        out.push(data.len() as u8);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
    }
    out.extend_from_slice(data);
    out.resize(out.len().div_ceil(4) * 4, 0);
    out
}

fn increment(data: &mut [u8]) {
    for byte in data.iter_mut().rev() {
        let (n, overflow) = byte.overflowing_add(1);
        *byte = n;
        if !overflow {
            break;
        }
    }
}

/// RSA-encrypt `data` using the MTProto RSA-PAD scheme.
///
/// `random_bytes` must be secure random data: the first 192 feed the
/// padding, the last 32 the temporary AES key. Returns `None` when `data`
/// exceeds 144 bytes.
pub fn encrypt_hashed(data: &[u8], key: &Key, random_bytes: &[u8; 224]) -> Option<Vec<u8>> {
    if data.len() > 144 {
        return None;
    }

    // data_with_padding: 192 bytes
    let mut data_with_padding = Vec::with_capacity(192);
    data_with_padding.extend_from_slice(data);
    data_with_padding.extend_from_slice(&random_bytes[..192 - data.len()]);

    let data_pad_reversed: Vec<u8> = data_with_padding.iter().copied().rev().collect();

    let mut temp_key = [0u8; 32];
    temp_key.copy_from_slice(&random_bytes[192..]);

    let key_aes_encrypted = loop {
        // data_with_hash = data_pad_reversed + SHA256(temp_key + data_with_padding)
        let mut data_with_hash = Vec::with_capacity(224);
        data_with_hash.extend_from_slice(&data_pad_reversed);
        data_with_hash.extend_from_slice(&sha256!(&temp_key, &data_with_padding));

        aes::ige_encrypt(&mut data_with_hash, &temp_key, &[0u8; 32]);

        // temp_key_xor = temp_key XOR SHA256(aes_encrypted)
        let hash = sha256!(&data_with_hash);
        let mut xored = temp_key;
        for (a, b) in xored.iter_mut().zip(hash.iter()) { *a ^= b; }

        let mut candidate = Vec::with_capacity(256);
        candidate.extend_from_slice(&xored);
        candidate.extend_from_slice(&data_with_hash);

        if BigUint::from_bytes_be(&candidate) < key.n {
            break candidate;
        }
        increment(&mut temp_key);
    };

    let payload = BigUint::from_bytes_be(&key_aes_encrypted);
    let encrypted = payload.modpow(&key.e, &key.n).to_bytes_be();
    let mut block = vec![0u8; 256usize.saturating_sub(encrypted.len())];
    block.extend_from_slice(&encrypted);
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_carries() {
        let mut data = [0x00, 0xff, 0xff];
        increment(&mut data);
        assert_eq!(data, [0x01, 0x00, 0x00]);
    }

    #[test]
    fn tl_bytes_pads_to_four() {
        assert_eq!(tl_bytes(&[1, 2, 3]), [3, 1, 2, 3]);
        assert_eq!(tl_bytes(&[1, 2, 3, 4]), [4, 1, 2, 3, 4, 0, 0, 0]);
        assert_eq!(tl_bytes(&[0; 256]).len(), 260);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let key = Key::new("3233", "17").unwrap();
        assert_eq!(encrypt_hashed(&[0; 145], &key, &[0; 224]), None);
    }
}
