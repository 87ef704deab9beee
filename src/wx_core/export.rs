//! Exports one account's data into a plaintext mirror of its data
//! directory: decrypted databases, decoded `.dat` images, and copies of
//! the plain media files.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::wx_core::account::{parse_xor_key, Account};
use crate::wx_core::crypto::{aes128_ecb_decrypt, xor_in_place, AES_BLOCK_SIZE};
use crate::wx_core::decryption::{decrypt, is_decrypted, DbVersion};
use crate::wx_core::image_key::{
    is_v4_dat_header, DAT_AES_LEN_OFFSET, DAT_HEADER_LEN, DAT_XOR_LEN_OFFSET, V4_FORMAT1,
    V4_FORMAT2,
};
use crate::wx_core::utils::{exists, CancelToken, WxCoreError, WxCoreResult};

/// XOR key most v4 installs use when none was recovered from disk.
pub const DEFAULT_V4_XOR_KEY: u8 = 0x37;

/// Known plaintext image prefixes for the v3 single-byte XOR scheme.
const IMAGE_PREFIXES: [&[u8]; 5] = [
    &[0xFF, 0xD8, 0xFF],       // jpeg
    &[0x89, 0x50, 0x4E, 0x47], // png
    &[0x47, 0x49, 0x46, 0x38], // gif
    &[0x49, 0x49, 0x2A, 0x00], // tiff
    &[0x42, 0x4D],             // bmp
];

/// Sniffs the v3 XOR key from a `.dat` head: the key must map the head
/// onto one known image prefix consistently.
pub fn sniff_xor_key(data: &[u8]) -> Option<u8> {
    for prefix in IMAGE_PREFIXES {
        if data.len() < prefix.len() {
            continue;
        }
        let key = prefix[0] ^ data[0];
        if prefix.iter().zip(data).all(|(p, b)| p ^ b == key) {
            return Some(key);
        }
    }
    None
}

/// Decodes a v3 `.dat` image (whole file XORed with one byte).
pub fn decrypt_dat_v3(data: &[u8]) -> Option<Vec<u8>> {
    let key = sniff_xor_key(data)?;
    let mut out = data.to_vec();
    xor_in_place(&mut out, key);
    Some(out)
}

/// Decodes a v4 `.dat` container: 15-byte header, an AES-128-ECB
/// encrypted head of the stored AES length (rounded up to whole blocks),
/// a passthrough middle, and a XOR-encrypted tail.
pub fn decrypt_dat_v4(data: &[u8], aes_key: &[u8; 16], xor_key: u8) -> WxCoreResult<Vec<u8>> {
    if data.len() < DAT_HEADER_LEN || !is_v4_dat_header(data) {
        return Err(WxCoreError::Malformed(
            "not a v4 image container".to_string(),
        ));
    }

    let aes_len = u32::from_le_bytes(
        data[DAT_AES_LEN_OFFSET..DAT_AES_LEN_OFFSET + 4]
            .try_into()
            .expect("four bytes at the aes-length field"),
    ) as usize;
    let xor_len = u32::from_le_bytes(
        data[DAT_XOR_LEN_OFFSET..DAT_XOR_LEN_OFFSET + 4]
            .try_into()
            .expect("four bytes at the xor-length field"),
    ) as usize;

    let mut payload = data[DAT_HEADER_LEN..].to_vec();
    let xor_covered = xor_len.min(payload.len());

    // The AES head never reaches into the XOR tail.
    let mut aes_covered = aes_len.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    aes_covered = aes_covered.min(payload.len() - xor_covered);
    aes_covered -= aes_covered % AES_BLOCK_SIZE;
    aes128_ecb_decrypt(aes_key, &mut payload[..aes_covered])?;

    if xor_covered > 0 {
        let tail_start = payload.len() - xor_covered;
        xor_in_place(&mut payload[tail_start..], xor_key);
    }
    Ok(payload)
}

/// Reads just enough of a file to see whether it already carries the
/// SQLite magic.
fn file_is_decrypted(path: &Path) -> WxCoreResult<bool> {
    use std::io::Read;

    let mut magic = [0u8; 16];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(is_decrypted(&magic)),
        // Shorter than one header: nothing decryptable either way.
        Err(_) => Ok(false),
    }
}

fn output_path(data_dir: &Path, out_dir: &Path, file: &Path) -> WxCoreResult<PathBuf> {
    let rel = file.strip_prefix(data_dir).map_err(|_| {
        WxCoreError::InvalidPath(format!(
            "'{}' is outside the data directory",
            file.display()
        ))
    })?;
    let out_file = out_dir.join(rel);
    if let Some(parent) = out_file.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(out_file)
}

/// Decrypts every database under the version's DB tree into the output
/// tree, mirroring relative paths. Files that already carry the SQLite
/// magic are copied through. Per-file failures are logged and skipped.
pub fn export_databases(
    account: &Account,
    out_dir: &Path,
    token: &CancelToken,
) -> WxCoreResult<usize> {
    let version = account
        .db_version()
        .ok_or_else(|| WxCoreError::UnsupportedVersion(account.version.to_string()))?;
    if account.key.is_empty() {
        return Err(WxCoreError::KeyInvalid(
            "no master key recovered for this account".to_string(),
        ));
    }

    let data_dir = account.data_dir_path();
    let db_dir = match version {
        DbVersion::V3 => data_dir.join("Msg"),
        DbVersion::V4 => data_dir.join("db_storage"),
    };

    let mut exported = 0usize;
    for entry in WalkDir::new(&db_dir).into_iter().filter_map(|e| e.ok()) {
        token.check()?;
        if !entry.file_type().is_file()
            || entry.path().extension().map_or(true, |ext| ext != "db")
        {
            continue;
        }

        let out_file = output_path(&data_dir, out_dir, entry.path())?;
        if exists(&out_file) {
            debug!("{} already exists, skipping", out_file.display());
            continue;
        }

        if file_is_decrypted(entry.path())? {
            fs::copy(entry.path(), &out_file)?;
            exported += 1;
            continue;
        }

        match decrypt(version, &account.key, entry.path(), &out_file, token) {
            Ok(_) => exported += 1,
            Err(WxCoreError::Cancelled) => return Err(WxCoreError::Cancelled),
            Err(e) => warn!("decrypting {} failed: {}", entry.path().display(), e),
        }
    }
    info!("exported {} database(s) from {}", exported, db_dir.display());
    Ok(exported)
}

/// The 16-byte AES key for a v4 container, preferring the key recovered
/// from process memory over the per-format constants.
fn v4_aes_key(account: &Account, magic: &[u8]) -> [u8; 16] {
    if *magic == V4_FORMAT1.header {
        return V4_FORMAT1.aes_key;
    }
    match account.image_aes_key.as_bytes().try_into() {
        Ok(key) => key,
        // Placeholder constant; containers decoded with it are suspect.
        Err(_) => V4_FORMAT2.aes_key,
    }
}

/// Decodes every `.dat` image under the version's image roots.
pub fn export_images(
    account: &Account,
    out_dir: &Path,
    token: &CancelToken,
) -> WxCoreResult<usize> {
    let version = account
        .db_version()
        .ok_or_else(|| WxCoreError::UnsupportedVersion(account.version.to_string()))?;
    let data_dir = account.data_dir_path();

    let roots: Vec<PathBuf> = match version {
        DbVersion::V3 => vec![
            data_dir.join("FileStorage").join("MsgAttach"),
            data_dir.join("FileStorage").join("Image"),
        ],
        DbVersion::V4 => vec![data_dir.join("msg").join("attach")],
    };
    let xor_key = parse_xor_key(&account.image_xor_key).unwrap_or(DEFAULT_V4_XOR_KEY);

    let mut exported = 0usize;
    for root in roots {
        if !exists(&root) {
            continue;
        }
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            token.check()?;
            let name = entry.file_name().to_string_lossy();
            if !entry.file_type().is_file() || !name.ends_with(".dat") {
                continue;
            }

            let data = match fs::read(entry.path()) {
                Ok(data) => data,
                Err(e) => {
                    warn!("reading {} failed: {}", entry.path().display(), e);
                    continue;
                }
            };

            let decoded = match version {
                DbVersion::V3 => decrypt_dat_v3(&data),
                DbVersion::V4 => {
                    if data.len() < 4 {
                        None
                    } else {
                        let key = v4_aes_key(account, &data[..4]);
                        decrypt_dat_v4(&data, &key, xor_key).ok()
                    }
                }
            };

            let decoded = match decoded {
                Some(decoded) => decoded,
                None => {
                    debug!("no decode for {}", entry.path().display());
                    continue;
                }
            };

            let out_file = output_path(&data_dir, out_dir, entry.path())?;
            fs::write(&out_file, decoded)?;
            exported += 1;
        }
    }
    info!("exported {} image(s)", exported);
    Ok(exported)
}

/// Copies the plain (unencrypted) media trees into the output tree.
pub fn export_media(
    account: &Account,
    out_dir: &Path,
    token: &CancelToken,
) -> WxCoreResult<usize> {
    let data_dir = account.data_dir_path();
    let roots = [
        data_dir.join("FileStorage").join("Video"),
        data_dir.join("FileStorage").join("File"),
        data_dir.join("FileStorage").join("Cache"),
    ];

    let mut copied = 0usize;
    for root in roots {
        if !exists(&root) {
            continue;
        }
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            token.check()?;
            if !entry.file_type().is_file() {
                continue;
            }
            let out_file = output_path(&data_dir, out_dir, entry.path())?;
            fs::copy(entry.path(), &out_file)?;
            copied += 1;
        }
    }
    info!("copied {} media file(s)", copied);
    Ok(copied)
}

/// Full export: databases, images, and media, in that order.
pub fn export_all(account: &Account, out_dir: &Path, token: &CancelToken) -> WxCoreResult<()> {
    fs::create_dir_all(out_dir)?;
    export_databases(account, out_dir, token)?;
    export_images(account, out_dir, token)?;
    export_media(account, out_dir, token)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wx_core::account::{format_xor_key, STATUS_OFFLINE};
    use crate::wx_core::decryption::tests::encrypt_file;
    use crate::wx_core::decryption::{KEY_SIZE, SALT_SIZE, SQLITE_FILE_HEADER};
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::Aes128;
    use tempfile::tempdir;

    #[test]
    fn xor_sniffing_recovers_the_key() {
        let mut jpg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x10, 0x20];
        xor_in_place(&mut jpg, 0x5a);
        assert_eq!(sniff_xor_key(&jpg), Some(0x5a));

        let decoded = decrypt_dat_v3(&jpg).unwrap();
        assert_eq!(&decoded[..3], &[0xFF, 0xD8, 0xFF]);

        assert_eq!(sniff_xor_key(&[0x00, 0x01, 0x02, 0x03]), None);
        assert!(decrypt_dat_v3(&[]).is_none());
    }

    fn aes_encrypt_blocks(key: &[u8; 16], data: &mut [u8]) {
        let cipher = Aes128::new(key.into());
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
    }

    fn v4_container(
        magic: [u8; 4],
        aes_key: &[u8; 16],
        xor_key: u8,
        plain: &[u8],
        aes_len: u32,
        xor_len: u32,
    ) -> Vec<u8> {
        let mut payload = plain.to_vec();
        let aes_covered = (aes_len as usize).div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
        aes_encrypt_blocks(aes_key, &mut payload[..aes_covered]);
        let tail_start = payload.len() - xor_len as usize;
        xor_in_place(&mut payload[tail_start..], xor_key);

        let mut data = vec![0u8; DAT_HEADER_LEN];
        data[..4].copy_from_slice(&magic);
        data[DAT_AES_LEN_OFFSET..DAT_AES_LEN_OFFSET + 4].copy_from_slice(&aes_len.to_le_bytes());
        data[DAT_XOR_LEN_OFFSET..DAT_XOR_LEN_OFFSET + 4].copy_from_slice(&xor_len.to_le_bytes());
        data.extend_from_slice(&payload);
        data
    }

    #[test]
    fn v4_container_round_trips() {
        let mut plain = vec![0u8; 64];
        plain[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
        plain[62..].copy_from_slice(&[0xFF, 0xD9]);

        let data = v4_container(
            V4_FORMAT1.header,
            &V4_FORMAT1.aes_key,
            0x37,
            &plain,
            20,
            10,
        );
        let decoded = decrypt_dat_v4(&data, &V4_FORMAT1.aes_key, 0x37).unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn v4_container_rejects_foreign_data() {
        let err = decrypt_dat_v4(&[0u8; 64], &V4_FORMAT1.aes_key, 0x37).unwrap_err();
        assert!(matches!(err, WxCoreError::Malformed(_)));
    }

    fn v3_account(data_dir: &Path, key: String) -> Account {
        Account {
            wxid: "wxid_test".into(),
            version: 3,
            data_dir: data_dir.to_string_lossy().into_owned(),
            key,
            status: STATUS_OFFLINE.into(),
            ..Default::default()
        }
    }

    #[test]
    fn export_decrypts_databases_and_images() {
        let master = [0x42u8; KEY_SIZE];
        let salt = [0x11u8; SALT_SIZE];
        let params = DbVersion::V3.params();
        let body = vec![0xa5u8; params.page_size - params.reserve - SALT_SIZE];
        let encrypted = encrypt_file(DbVersion::V3, &master, &salt, &[body]);

        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("wxid_test");
        fs::create_dir_all(data_dir.join("Msg")).unwrap();
        fs::write(data_dir.join("Msg/MicroMsg.db"), &encrypted).unwrap();
        fs::write(data_dir.join("Msg/notes.txt"), b"not a db").unwrap();

        let image_dir = data_dir.join("FileStorage").join("Image");
        fs::create_dir_all(&image_dir).unwrap();
        let mut dat = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        xor_in_place(&mut dat, 0x21);
        fs::write(image_dir.join("pic.dat"), &dat).unwrap();

        let out_dir = dir.path().join("out");
        let account = v3_account(&data_dir, hex::encode_upper(master));
        export_all(&account, &out_dir, &CancelToken::new()).unwrap();

        let db_out = fs::read(out_dir.join("Msg/MicroMsg.db")).unwrap();
        assert_eq!(&db_out[..16], SQLITE_FILE_HEADER);
        assert!(!out_dir.join("Msg/notes.txt").exists());

        let img_out = fs::read(out_dir.join("FileStorage/Image/pic.dat")).unwrap();
        assert_eq!(&img_out[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn export_requires_a_key_for_databases() {
        let dir = tempdir().unwrap();
        let account = v3_account(dir.path(), String::new());
        let err = export_databases(&account, &dir.path().join("out"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, WxCoreError::KeyInvalid(_)));
    }

    #[test]
    fn export_respects_cancellation() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("wxid_test");
        fs::create_dir_all(data_dir.join("Msg")).unwrap();
        fs::write(data_dir.join("Msg/MicroMsg.db"), b"junk").unwrap();

        let token = CancelToken::new();
        token.cancel();
        let account = v3_account(&data_dir, "AB".repeat(KEY_SIZE));
        let err = export_databases(&account, &dir.path().join("out"), &token).unwrap_err();
        assert!(matches!(err, WxCoreError::Cancelled));
    }

    #[test]
    fn xor_key_falls_back_to_the_default() {
        let account = Account::default();
        assert_eq!(
            parse_xor_key(&account.image_xor_key).unwrap_or(DEFAULT_V4_XOR_KEY),
            DEFAULT_V4_XOR_KEY
        );
        assert_eq!(parse_xor_key(&format_xor_key(0x21)), Some(0x21));
    }
}
