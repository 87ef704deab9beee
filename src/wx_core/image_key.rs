//! v4 image-key recovery.
//!
//! Stage 1 derives the single-byte XOR key from the tail of a thumbnail
//! container, whose decrypted form is a JPG ending in `FF D9`. Stage 2
//! lifts one known ciphertext block out of a regular attachment and
//! brute-checks every hex-looking 16-byte string in process memory as an
//! AES-128-ECB key against it.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::path::Path;
use walkdir::WalkDir;

use log::{debug, warn};

use crate::wx_core::crypto::aes128_ecb_decrypt_block;

pub const JPG_HEADER: [u8; 3] = [0xFF, 0xD8, 0xFF];
pub const WXGF_HEADER: [u8; 4] = [0x77, 0x78, 0x67, 0x66];
pub const JPG_TAIL: [u8; 2] = [0xFF, 0xD9];

/// v4 image container header length: 4 magic bytes, 2 unused, a 4-byte
/// AES length, a 4-byte XOR length, and a flag byte.
pub const DAT_HEADER_LEN: usize = 15;
pub const DAT_XOR_LEN_OFFSET: usize = 10;
pub const DAT_AES_LEN_OFFSET: usize = 6;

/// A v4 `.dat` container flavour: its magic and the AES key that opens
/// its encrypted head.
#[derive(Debug, Clone, Copy)]
pub struct DatFormat {
    pub header: [u8; 4],
    pub aes_key: [u8; 16],
}

/// Containers written with the fixed key.
pub const V4_FORMAT1: DatFormat = DatFormat {
    header: [0x07, 0x08, 0x56, 0x31],
    aes_key: *b"cfcd208495d565ef",
};

/// Containers keyed per account; the constant below is a placeholder the
/// memory-recovered key supersedes.
pub const V4_FORMAT2: DatFormat = DatFormat {
    header: [0x07, 0x08, 0x56, 0x32],
    aes_key: *b"0000000000000000",
};

pub fn is_v4_dat_header(data: &[u8]) -> bool {
    data.len() >= 4 && (data[..4] == V4_FORMAT1.header || data[..4] == V4_FORMAT2.header)
}

/// XOR key derived from one thumbnail file, together with whether both
/// tail bytes agreed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorKeyCandidate {
    pub key: u8,
    pub consistent: bool,
}

/// Derives the XOR key from a full `_t.dat` file image: the trailing
/// `xorEncryptLen` bytes of the payload are XOR ciphertext whose final
/// two plaintext bytes are the JPG tail `FF D9`.
pub fn derive_xor_key(data: &[u8]) -> Option<XorKeyCandidate> {
    if data.len() < DAT_HEADER_LEN || !is_v4_dat_header(data) {
        return None;
    }

    let xor_len = u32::from_le_bytes(
        data[DAT_XOR_LEN_OFFSET..DAT_XOR_LEN_OFFSET + 4]
            .try_into()
            .expect("four bytes at the xor-length field"),
    ) as usize;

    let tail = &data[DAT_HEADER_LEN..];
    if xor_len == 0 || tail.len() < JPG_TAIL.len() {
        return None;
    }

    // A stored xor length larger than the payload clamps to it; the last
    // two payload bytes are the covered plaintext tail either way.
    let covered = xor_len.min(tail.len());
    let xor_part = &tail[tail.len() - covered..];
    if xor_part.len() < JPG_TAIL.len() {
        return None;
    }

    let k0 = xor_part[xor_part.len() - 2] ^ JPG_TAIL[0];
    let k1 = xor_part[xor_part.len() - 1] ^ JPG_TAIL[1];
    Some(XorKeyCandidate {
        key: k0,
        consistent: k0 == k1,
    })
}

/// Stage 1: walk the data directory for the first thumbnail that yields
/// an XOR key.
pub fn find_xor_key(data_dir: impl AsRef<Path>) -> Option<u8> {
    for entry in WalkDir::new(data_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with("_t.dat") {
            continue;
        }
        let data = match std::fs::read(entry.path()) {
            Ok(data) => data,
            Err(_) => continue,
        };
        if let Some(candidate) = derive_xor_key(&data) {
            if !candidate.consistent {
                warn!(
                    "inconsistent XOR key in {}, using first byte {:#04x}",
                    entry.path().display(),
                    candidate.key
                );
            }
            return Some(candidate.key);
        }
    }
    None
}

/// Stage 2 setup: the first ciphertext block of a regular v4 attachment
/// under `msg/attach`, used as the known plaintext oracle.
pub fn known_ciphertext(data_dir: impl AsRef<Path>) -> Option<[u8; 16]> {
    let attach_dir = data_dir.as_ref().join("msg").join("attach");
    for entry in WalkDir::new(attach_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".dat") || name.ends_with("_t.dat") {
            continue;
        }
        let data = match std::fs::read(entry.path()) {
            Ok(data) => data,
            Err(_) => continue,
        };
        if data.len() >= DAT_HEADER_LEN + 16 && data[..4] == V4_FORMAT2.header {
            debug!("known ciphertext taken from {}", entry.path().display());
            let mut block = [0u8; 16];
            block.copy_from_slice(&data[DAT_HEADER_LEN..DAT_HEADER_LEN + 16]);
            return Some(block);
        }
    }
    None
}

static AES_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9]{16}").expect("aes key regex compiles"));

/// Non-overlapping 16-byte lowercase-hex-looking runs in a region buffer.
pub fn aes_key_candidates(buffer: &[u8]) -> impl Iterator<Item = &[u8]> {
    AES_KEY_REGEX.find_iter(buffer).map(|m| m.as_bytes())
}

/// A candidate is the AES key iff it decrypts the known block to a JPG or
/// WXGF header.
pub fn validate_image_aes_key(encrypted: &[u8; 16], key: &[u8]) -> bool {
    if key.len() < 16 {
        return false;
    }
    let aes_key: [u8; 16] = key[..16].try_into().expect("checked length");
    let decrypted = aes128_ecb_decrypt_block(&aes_key, encrypted);
    decrypted.starts_with(&JPG_HEADER) || decrypted.starts_with(&WXGF_HEADER)
}

#[cfg(windows)]
pub use windows_impl::scan_aes_key;

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::wx_core::memory::{
        produce_regions, worker_count, MemoryRegion, IMAGE_SCAN_MIN_REGION, MAX_IMAGE_WORKERS,
        REGION_CHANNEL_CAPACITY,
    };
    use crate::wx_core::utils::{CancelToken, WxCoreResult};
    use crate::wx_core::win_api::ProcessHandle;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use log::info;

    /// Stage 2: scan the live process for the 16-byte image AES key.
    /// Returns the key as its ASCII form, or None when either no known
    /// ciphertext exists on disk or the scan runs dry.
    pub fn scan_aes_key(
        pid: u32,
        data_dir: &Path,
        token: &CancelToken,
    ) -> WxCoreResult<Option<String>> {
        let encrypted = match known_ciphertext(data_dir) {
            Some(block) => block,
            None => {
                warn!("no v4 attachment with a known ciphertext block under msg/attach");
                return Ok(None);
            }
        };

        let handle = ProcessHandle::open(pid)?;
        let scan = CancelToken::new();

        let (region_tx, region_rx) = bounded::<MemoryRegion>(REGION_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = bounded::<String>(1);

        let workers = worker_count(MAX_IMAGE_WORKERS);
        debug!("starting {} workers for the image AES key search", workers);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let region_rx = region_rx.clone();
                let result_tx = result_tx.clone();
                let scan = &scan;
                let encrypted = &encrypted;
                s.spawn(move || {
                    aes_key_worker(encrypted, region_rx, result_tx, token, scan)
                });
            }
            drop(region_rx);
            drop(result_tx);

            s.spawn(|| {
                if !token.is_cancelled() {
                    produce_regions(&handle, IMAGE_SCAN_MIN_REGION, &region_tx, &scan);
                }
                drop(region_tx);
            });
        });

        if let Ok(key) = result_rx.try_recv() {
            info!("image AES key recovered for pid {}", pid);
            return Ok(Some(key));
        }
        token.check()?;
        info!("image AES key scan finished without a hit");
        Ok(None)
    }

    fn aes_key_worker(
        encrypted: &[u8; 16],
        region_rx: Receiver<MemoryRegion>,
        result_tx: Sender<String>,
        token: &CancelToken,
        scan: &CancelToken,
    ) {
        for region in region_rx.iter() {
            if token.is_cancelled() || scan.is_cancelled() {
                return;
            }
            for candidate in aes_key_candidates(&region.bytes) {
                if token.is_cancelled() || scan.is_cancelled() {
                    return;
                }
                if validate_image_aes_key(encrypted, candidate) {
                    let key = String::from_utf8_lossy(candidate).into_owned();
                    let _ = result_tx.try_send(key);
                    scan.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::Aes128;

    fn thumb_file(header: [u8; 4], xor_len: u32, tail: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; DAT_HEADER_LEN];
        data[..4].copy_from_slice(&header);
        data[DAT_XOR_LEN_OFFSET..DAT_XOR_LEN_OFFSET + 4].copy_from_slice(&xor_len.to_le_bytes());
        data.extend_from_slice(tail);
        data
    }

    #[test]
    fn xor_key_from_mismatched_tail_bytes() {
        // 17 payload bytes ending A5 9B with a stored xor length of 32;
        // the key comes from A5 ^ FF and the second byte disagrees.
        let mut tail = vec![0x00u8; 17];
        tail[15] = 0xA5;
        tail[16] = 0x9B;
        let data = thumb_file(V4_FORMAT1.header, 32, &tail);

        let candidate = derive_xor_key(&data).expect("key derived");
        assert_eq!(candidate.key, 0x5A);
        assert!(!candidate.consistent);
    }

    #[test]
    fn xor_key_from_agreeing_tail_bytes() {
        let key = 0x37u8;
        let tail = vec![JPG_TAIL[0] ^ key, JPG_TAIL[1] ^ key];
        let data = thumb_file(V4_FORMAT2.header, 2, &tail);

        let candidate = derive_xor_key(&data).expect("key derived");
        assert_eq!(candidate.key, key);
        assert!(candidate.consistent);
    }

    #[test]
    fn xor_key_guards() {
        // Unknown magic
        assert!(derive_xor_key(&thumb_file([0, 1, 2, 3], 8, &[0u8; 8])).is_none());
        // Zero xor length
        assert!(derive_xor_key(&thumb_file(V4_FORMAT1.header, 0, &[0u8; 8])).is_none());
        // Payload too short to hold the JPG tail
        assert!(derive_xor_key(&thumb_file(V4_FORMAT1.header, 4, &[0u8; 1])).is_none());
        // Header alone
        assert!(derive_xor_key(&V4_FORMAT1.header).is_none());
    }

    fn encrypt_block(key: &[u8; 16], plain: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(key.into());
        let mut block = GenericArray::clone_from_slice(plain);
        cipher.encrypt_block(&mut block);
        block.into()
    }

    #[test]
    fn aes_key_validation_accepts_only_the_right_key() {
        let key = *b"a64a9398b283d8cb";
        let mut plain = [0u8; 16];
        plain[..3].copy_from_slice(&JPG_HEADER);
        let encrypted = encrypt_block(&key, &plain);

        assert!(validate_image_aes_key(&encrypted, &key));

        let mut flipped = key;
        flipped[0] ^= 0x01;
        assert!(!validate_image_aes_key(&encrypted, &flipped));
        assert!(!validate_image_aes_key(&encrypted, &key[..8]));
    }

    #[test]
    fn aes_key_validation_accepts_wxgf_plaintext() {
        let key = *b"0123456789abcdef";
        let mut plain = [0u8; 16];
        plain[..4].copy_from_slice(&WXGF_HEADER);
        let encrypted = encrypt_block(&key, &plain);
        assert!(validate_image_aes_key(&encrypted, &key));
    }

    #[test]
    fn candidate_regex_finds_hexlike_runs() {
        let mut buffer = vec![0xffu8; 64];
        buffer.extend_from_slice(b"a64a9398b283d8cb");
        buffer.extend_from_slice(&[0x00, 0x80]);
        buffer.extend_from_slice(b"UPPER-not-a-key!");

        let found: Vec<&[u8]> = aes_key_candidates(&buffer).collect();
        assert_eq!(found, vec![&b"a64a9398b283d8cb"[..]]);
    }

    #[test]
    fn candidate_regex_is_non_overlapping() {
        // A 32-char run yields exactly two adjacent candidates.
        let buffer = b"\x01a64a9398b283d8cbcfcd208495d565ef\x02".to_vec();
        let found: Vec<&[u8]> = aes_key_candidates(&buffer).collect();
        assert_eq!(
            found,
            vec![&b"a64a9398b283d8cb"[..], &b"cfcd208495d565ef"[..]]
        );
    }

    #[test]
    fn known_ciphertext_picks_format2_attachments() {
        use std::fs;
        let dir = tempfile::tempdir().unwrap();
        let attach = dir.path().join("msg").join("attach").join("2025-06");
        fs::create_dir_all(&attach).unwrap();

        // Thumbnail and format-1 files must be passed over.
        let mut t = thumb_file(V4_FORMAT2.header, 2, &[0u8; 20]);
        fs::write(attach.join("img_t.dat"), &t).unwrap();
        t = thumb_file(V4_FORMAT1.header, 2, &[0u8; 20]);
        fs::write(attach.join("older.dat"), &t).unwrap();

        let mut wanted = vec![0u8; DAT_HEADER_LEN];
        wanted[..4].copy_from_slice(&V4_FORMAT2.header);
        wanted.extend_from_slice(&[0xabu8; 32]);
        fs::write(attach.join("real.dat"), &wanted).unwrap();

        assert_eq!(known_ciphertext(dir.path()), Some([0xabu8; 16]));
    }
}
