//! Telink block primitives.
//!
//! Telink radios run AES-128 on byte-reversed keys and blocks. Everything
//! here operates on 16-byte blocks in wire order.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};

/// Cipher block size.
pub const BLOCK_LEN: usize = 16;

/// A single cipher block.
pub type Block = [u8; BLOCK_LEN];

/// Encrypts one block the way the Telink firmware does.
#[must_use]
pub fn encrypt(key: &Block, data: &Block) -> Block {
    let mut reversed_key = *key;
    reversed_key.reverse();
    let cipher = Aes128::new(GenericArray::from_slice(&reversed_key));

    let mut block = *data;
    block.reverse();
    let mut block = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&block);
    out.reverse();
    out
}

/// Zero-pads (or truncates) a byte string to one block.
#[must_use]
pub fn pad(data: &[u8]) -> Block {
    let mut block = [0u8; BLOCK_LEN];
    let len = data.len().min(BLOCK_LEN);
    block[..len].copy_from_slice(&data[..len]);
    block
}

/// XORs two blocks.
#[must_use]
pub fn xor(a: &Block, b: &Block) -> Block {
    let mut out = [0u8; BLOCK_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// CBC-MAC style checksum over `nonce || len` followed by the payload.
#[must_use]
pub fn checksum(key: &Block, nonce: &[u8; 8], payload: &[u8]) -> Block {
    let mut base = [0u8; BLOCK_LEN];
    base[..8].copy_from_slice(nonce);
    base[8] = payload.len() as u8;
    let mut check = encrypt(key, &base);
    for chunk in payload.chunks(BLOCK_LEN) {
        check = encrypt(key, &xor(&check, &pad(chunk)));
    }
    check
}

/// CTR-style keystream applied in place. Encrypting and decrypting are the
/// same operation.
pub fn crypt(key: &Block, nonce: &[u8; 8], payload: &mut [u8]) {
    let mut base = [0u8; BLOCK_LEN];
    base[1..9].copy_from_slice(nonce);
    for chunk in payload.chunks_mut(BLOCK_LEN) {
        let stream = encrypt(key, &base);
        for (byte, key_byte) in chunk.iter_mut().zip(stream) {
            *byte ^= key_byte;
        }
        base[0] = base[0].wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_matches_reversed_aes() {
        // FIPS-197 appendix C.1, with every block reversed
        let mut key: Block = core::array::from_fn(|i| i as u8);
        let mut plain: Block = core::array::from_fn(|i| (i as u8) * 0x11);
        key.reverse();
        plain.reverse();
        let mut expected = [
            0x69, 0xC4, 0xE0, 0xD8, 0x6A, 0x7B, 0x04, 0x30, 0xD8, 0xCD, 0xB7, 0x80, 0x70, 0xB4,
            0xC5, 0x5A,
        ];
        expected.reverse();
        assert_eq!(encrypt(&key, &plain), expected);
    }

    #[test]
    fn test_pad_and_xor() {
        let block = pad(b"abc");
        assert_eq!(&block[..3], b"abc");
        assert!(block[3..].iter().all(|b| *b == 0));
        assert_eq!(pad(&[1u8; 20]), [1u8; 16]);
        assert_eq!(xor(&block, &block), [0u8; 16]);
    }

    #[test]
    fn test_crypt_is_involution() {
        let key = pad(b"session key");
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        let original: Vec<u8> = (0..20).collect();
        let mut data = original.clone();
        crypt(&key, &nonce, &mut data);
        assert_ne!(data, original);
        crypt(&key, &nonce, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_checksum_depends_on_payload() {
        let key = pad(b"session key");
        let nonce = [0; 8];
        assert_ne!(checksum(&key, &nonce, &[1, 2, 3]), checksum(&key, &nonce, &[1, 2, 4]));
        assert_eq!(checksum(&key, &nonce, &[1, 2, 3]), checksum(&key, &nonce, &[1, 2, 3]));
    }
}
