use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockDecryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha512;

use crate::wx_core::utils::{WxCoreError, WxCoreResult};

pub const AES_BLOCK_SIZE: usize = 16;

type HmacSha1 = Hmac<Sha1>;
type HmacSha512 = Hmac<Sha512>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Hash function behind PBKDF2 and HMAC. The v3 on-disk format uses SHA-1,
/// v4 uses SHA-512; everything else about the page layout is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha1,
    Sha512,
}

impl HashKind {
    pub fn hmac_len(self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha512 => 64,
        }
    }
}

/// PBKDF2 key derivation into `out`, hash selected at run time.
pub fn derive_pbkdf2(password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8], hash: HashKind) {
    match hash {
        HashKind::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, rounds, out),
        HashKind::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, rounds, out),
    }
}

/// HMAC over a sequence of parts, fed in order without copying them into
/// one buffer first.
pub fn hmac_tag(key: &[u8], parts: &[&[u8]], hash: HashKind) -> Vec<u8> {
    match hash {
        HashKind::Sha1 => {
            let mut mac =
                <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
        HashKind::Sha512 => {
            let mut mac =
                <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// In-place AES-256-CBC decryption without padding removal; callers know
/// their exact sizes. The only possible error is a ciphertext length that
/// is not block-aligned.
pub fn aes256_cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> WxCoreResult<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(WxCoreError::Malformed(format!(
            "ciphertext length {} is not a multiple of the AES block size",
            data.len()
        )));
    }

    let mut cipher = Aes256CbcDec::new(key.into(), iv.into());
    for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
    Ok(())
}

/// Single-block AES-128-ECB decryption, used to test image-key candidates
/// against a known ciphertext block.
pub fn aes128_ecb_decrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut out = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut out);
    out.into()
}

/// AES-128-ECB over a whole buffer (block-aligned), used for the v4 image
/// container's encrypted head.
pub fn aes128_ecb_decrypt(key: &[u8; 16], data: &mut [u8]) -> WxCoreResult<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(WxCoreError::Malformed(format!(
            "ciphertext length {} is not a multiple of the AES block size",
            data.len()
        )));
    }

    let cipher = Aes128::new(key.into());
    for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(())
}

/// XOR every byte of `buf` with `key`, in place. Applying it twice with
/// the same key restores the input.
pub fn xor_in_place(buf: &mut [u8], key: u8) {
    for b in buf.iter_mut() {
        *b ^= key;
    }
}

/// Byte-wise XOR of a copy, used for the MAC salt (`salt ^ 0x3a`).
pub fn xor_bytes(data: &[u8], key: u8) -> Vec<u8> {
    data.iter().map(|&b| b ^ key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_an_involution() {
        let original: Vec<u8> = (0u8..=255).collect();
        let mut buf = original.clone();
        xor_in_place(&mut buf, 0x5a);
        assert_ne!(buf, original);
        xor_in_place(&mut buf, 0x5a);
        assert_eq!(buf, original);

        assert_eq!(xor_bytes(&xor_bytes(&original, 0x3a), 0x3a), original);
    }

    #[test]
    fn hmac_parts_equal_one_shot() {
        let key = b"0123456789abcdef";
        let joined = hmac_tag(key, &[b"hello world"], HashKind::Sha1);
        let split = hmac_tag(key, &[b"hello ", b"world"], HashKind::Sha1);
        assert_eq!(joined, split);
        assert_eq!(joined.len(), HashKind::Sha1.hmac_len());
        assert_eq!(
            hmac_tag(key, &[b"x"], HashKind::Sha512).len(),
            HashKind::Sha512.hmac_len()
        );
    }

    #[test]
    fn cbc_rejects_unaligned_input() {
        let mut data = vec![0u8; 17];
        let err = aes256_cbc_decrypt(&[0u8; 32], &[0u8; 16], &mut data).unwrap_err();
        assert!(matches!(err, WxCoreError::Malformed(_)));
    }

    #[test]
    fn ecb_single_block_matches_buffer_decrypt() {
        let key = *b"cfcd208495d565ef";
        let block = [0x42u8; 16];
        let single = aes128_ecb_decrypt_block(&key, &block);

        let mut buf = block.to_vec();
        aes128_ecb_decrypt(&key, &mut buf).unwrap();
        assert_eq!(buf, single);
    }
}
