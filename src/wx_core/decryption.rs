use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::wx_core::crypto::{
    aes256_cbc_decrypt, derive_pbkdf2, hmac_tag, xor_bytes, HashKind, AES_BLOCK_SIZE,
};
use crate::wx_core::utils::{wx_core_error, CancelToken, WxCoreError, WxCoreResult};

pub const SQLITE_FILE_HEADER: &[u8; 16] = b"SQLite format 3\x00";
pub const PAGE_SIZE: usize = 4096;
pub const SALT_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

const MAC_SALT_XOR: u8 = 0x3a;
const MAC_ITER_COUNT: u32 = 2;

/// On-disk format version of a WeChat database. Everything that differs
/// between the two lives in [`DbParams`]; the page codec itself is a pure
/// function of those parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbVersion {
    V3,
    V4,
}

impl DbVersion {
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            3 => Some(DbVersion::V3),
            4 => Some(DbVersion::V4),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            DbVersion::V3 => 3,
            DbVersion::V4 => 4,
        }
    }

    /// Relative path of the reference database used for key validation.
    pub fn reference_db(self) -> &'static Path {
        match self {
            DbVersion::V3 => Path::new("Msg/Misc.db"),
            DbVersion::V4 => Path::new("db_storage/message/message_0.db"),
        }
    }

    pub fn params(self) -> DbParams {
        match self {
            DbVersion::V3 => DbParams::new(HashKind::Sha1, 64_000),
            DbVersion::V4 => DbParams::new(HashKind::Sha512, 256_000),
        }
    }
}

/// Per-version page-format parameters.
#[derive(Debug, Clone, Copy)]
pub struct DbParams {
    pub hash: HashKind,
    pub iter_count: u32,
    pub hmac_len: usize,
    pub reserve: usize,
    pub page_size: usize,
}

impl DbParams {
    fn new(hash: HashKind, iter_count: u32) -> Self {
        let hmac_len = hash.hmac_len();
        let mut reserve = IV_SIZE + hmac_len;
        if reserve % AES_BLOCK_SIZE != 0 {
            reserve = (reserve / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
        }
        Self {
            hash,
            iter_count,
            hmac_len,
            reserve,
            page_size: PAGE_SIZE,
        }
    }

    /// Derives the page-encryption key and the MAC key from the 32-byte
    /// master key and the file salt.
    pub fn derive_keys(&self, master: &[u8], salt: &[u8]) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
        let mut enc_key = [0u8; KEY_SIZE];
        derive_pbkdf2(master, salt, self.iter_count, &mut enc_key, self.hash);

        let mac_salt = xor_bytes(salt, MAC_SALT_XOR);
        let mut mac_key = [0u8; KEY_SIZE];
        derive_pbkdf2(&enc_key, &mac_salt, MAC_ITER_COUNT, &mut mac_key, self.hash);

        (enc_key, mac_key)
    }

    /// MAC check for the page at zero-based `index`. The MAC input is the
    /// page body (minus the salt on page 0) followed by the IV and the
    /// little-endian page number counted from 1.
    fn verify_page_mac(&self, page: &[u8], index: u64, mac_key: &[u8; KEY_SIZE]) -> bool {
        let body_start = if index == 0 { SALT_SIZE } else { 0 };
        let mac_end = self.page_size - self.reserve + IV_SIZE;
        let page_no = (index as u32 + 1).to_le_bytes();

        let tag = hmac_tag(mac_key, &[&page[body_start..mac_end], &page_no], self.hash);
        tag[..self.hmac_len] == page[mac_end..mac_end + self.hmac_len]
    }

    /// Key validation against the first page of an encrypted database:
    /// derive the MAC key from the page's leading salt and check the MAC.
    /// No decryption is involved.
    pub fn validate_page1(&self, page1: &[u8], key: &[u8]) -> bool {
        if page1.len() < self.page_size || key.len() != KEY_SIZE {
            return false;
        }
        let salt = &page1[..SALT_SIZE];
        let (_, mac_key) = self.derive_keys(key, salt);
        self.verify_page_mac(&page1[..self.page_size], 0, &mac_key)
    }

    /// Decrypts one page in place and returns the slice to emit: plaintext
    /// body followed by the original reserve trailer. Page 0 drops its
    /// leading salt so that the output stays page-aligned once the SQLite
    /// header is prepended.
    fn decrypt_page<'a>(
        &self,
        page: &'a mut [u8],
        index: u64,
        enc_key: &[u8; KEY_SIZE],
        mac_key: &[u8; KEY_SIZE],
    ) -> WxCoreResult<&'a [u8]> {
        if !self.verify_page_mac(page, index, mac_key) {
            return Err(WxCoreError::KeyInvalid(format!(
                "HMAC mismatch on page {}",
                index + 1
            )));
        }

        let body_start = if index == 0 { SALT_SIZE } else { 0 };
        let body_end = self.page_size - self.reserve;
        let iv: [u8; IV_SIZE] = page[body_end..body_end + IV_SIZE]
            .try_into()
            .expect("reserve always holds a full IV");

        aes256_cbc_decrypt(enc_key, &iv, &mut page[body_start..body_end])?;
        Ok(&page[body_start..])
    }
}

/// True when the file already carries the plaintext SQLite magic, i.e.
/// there is nothing to decrypt.
pub fn is_decrypted(data: &[u8]) -> bool {
    data.starts_with(SQLITE_FILE_HEADER)
}

fn decode_key(key: &str) -> WxCoreResult<Vec<u8>> {
    if key.len() != KEY_SIZE * 2 {
        return Err(WxCoreError::KeyInvalid(format!(
            "key: '{}' Len Error!",
            key
        )));
    }
    hex::decode(key.trim())
        .map_err(|_| WxCoreError::KeyInvalid(format!("key: '{}' Invalid hex!", key)))
}

/// Decrypt a WeChat database file
pub fn decrypt(
    version: DbVersion,
    key: &str,
    db_path: impl AsRef<Path>,
    out_path: impl AsRef<Path>,
    token: &CancelToken,
) -> WxCoreResult<(PathBuf, PathBuf, String)> {
    wx_core_error(|| {
        let db_path = db_path.as_ref();
        let out_path = out_path.as_ref();

        if !db_path.exists() || !db_path.is_file() {
            return Err(WxCoreError::InvalidPath(format!(
                "db_path: '{}' File not found!",
                db_path.display()
            )));
        }
        if !out_path.parent().map_or(false, |p| p.exists()) {
            return Err(WxCoreError::InvalidPath(format!(
                "out_path: '{}' Parent directory not found!",
                out_path.display()
            )));
        }

        let master = decode_key(key)?;

        let mut file = File::open(db_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        decrypt_bytes(version, &master, &data, out_path, token)?;
        Ok((db_path.to_path_buf(), out_path.to_path_buf(), key.to_string()))
    })
}

/// Codec core over an in-memory encrypted image. A truncated trailing
/// fragment (shorter than one page) is dropped; all-zero pages are copied
/// through untouched.
fn decrypt_bytes(
    version: DbVersion,
    master: &[u8],
    data: &[u8],
    out_path: &Path,
    token: &CancelToken,
) -> WxCoreResult<()> {
    let params = version.params();
    let total_pages = data.len() / params.page_size;

    if total_pages == 0 {
        let mut writer = File::create(out_path)?;
        writer.write_all(SQLITE_FILE_HEADER)?;
        return Ok(());
    }

    let first_page = &data[..params.page_size];
    if !params.validate_page1(first_page, master) {
        return Err(WxCoreError::KeyInvalid(
            "key rejected by the first page's HMAC".to_string(),
        ));
    }

    let salt = &data[..SALT_SIZE];
    let (enc_key, mac_key) = params.derive_keys(master, salt);

    let mut writer = BufWriter::new(File::create(out_path)?);
    writer.write_all(SQLITE_FILE_HEADER)?;

    let mut page_buf = vec![0u8; params.page_size];
    for index in 0..total_pages as u64 {
        token.check()?;

        let start = index as usize * params.page_size;
        page_buf.copy_from_slice(&data[start..start + params.page_size]);

        if page_buf.iter().all(|&b| b == 0) {
            writer.write_all(&page_buf)?;
            continue;
        }

        let plain = params.decrypt_page(&mut page_buf, index, &enc_key, &mac_key)?;
        writer.write_all(plain)?;
    }

    writer.flush()?;
    Ok(())
}

/// Batch decrypt WeChat database files
pub fn batch_decrypt(
    version: DbVersion,
    key: &str,
    db_path: impl AsRef<Path>,
    out_path: impl AsRef<Path>,
    is_print: bool,
    token: &CancelToken,
) -> WxCoreResult<Vec<WxCoreResult<(PathBuf, PathBuf, String)>>> {
    wx_core_error(|| {
        let db_path = db_path.as_ref();
        let out_path = out_path.as_ref();

        if key.len() != KEY_SIZE * 2 {
            return Err(WxCoreError::KeyInvalid(format!(
                "key: '{}' Len Error!",
                key
            )));
        }
        if !out_path.exists() {
            return Err(WxCoreError::InvalidPath(format!(
                "out_path: '{}' not found!",
                out_path.display()
            )));
        }
        if !db_path.exists() {
            return Err(WxCoreError::InvalidPath(format!(
                "db_path: '{}' not found!",
                db_path.display()
            )));
        }

        let mut process_list = Vec::new();
        if db_path.is_file() {
            let out_file = format!(
                "de_{}",
                db_path.file_name().unwrap_or_default().to_string_lossy()
            );
            process_list.push((db_path.to_path_buf(), out_path.join(out_file)));
        } else {
            for entry in walkdir::WalkDir::new(db_path) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let in_path = entry.path().to_path_buf();
                let rel_path = in_path.strip_prefix(db_path).unwrap_or(&in_path);
                let out_file = format!(
                    "de_{}",
                    rel_path.file_name().unwrap_or_default().to_string_lossy()
                );
                let out_dir = out_path.join(rel_path.parent().unwrap_or(Path::new("")));
                fs::create_dir_all(&out_dir)?;
                process_list.push((in_path, out_dir.join(out_file)));
            }
        }

        let mut results = Vec::new();
        for (in_path, out_file_path) in process_list {
            token.check()?;
            results.push(decrypt(version, key, in_path, out_file_path, token));
        }

        // Drop directories that ended up holding nothing
        if db_path.is_dir() {
            for entry in walkdir::WalkDir::new(out_path).contents_first(true) {
                let entry = entry?;
                if entry.file_type().is_dir() && fs::read_dir(entry.path())?.next().is_none() {
                    fs::remove_dir(entry.path())?;
                }
            }
        }

        if is_print {
            println!("{}", "=".repeat(32));
            let mut success_count = 0;
            let mut fail_count = 0;
            for result in &results {
                match result {
                    Ok((in_path, out_file, _)) => {
                        println!("[+] \"{}\" -> \"{}\"", in_path.display(), out_file.display());
                        success_count += 1;
                    }
                    Err(e) => {
                        println!("{}", e);
                        fail_count += 1;
                    }
                }
            }
            println!("{}", "-".repeat(32));
            println!(
                "[+] {} file(s), {} succeeded, {} failed",
                results.len(),
                success_count,
                fail_count
            );
            println!("{}", "=".repeat(32));
        } else {
            let ok = results.iter().filter(|r| r.is_ok()).count();
            info!("batch decrypt: {}/{} files succeeded", ok, results.len());
            debug!("batch decrypt output dir: {}", out_path.display());
        }

        Ok(results)
    })
}
