//! Account/user-info recovery.
//!
//! v3 keeps the display name, account, phone, and a pointer to the master
//! key at fixed offsets inside `WeChatWin.dll`, keyed by the exact client
//! build. v4 dropped the module anchors, so its user-info record is found
//! by a structural regex over heap memory instead: three length-prefixed
//! inline strings followed by an 11-digit phone marker.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

/// The v3 module every offset in the table is relative to.
pub const V3_MODULE_NAME: &str = "WeChatWin.dll";

/// Bytes read per string field at a module-relative offset.
pub const V3_STRING_READ_LEN: usize = 100;

/// Recovered user-facing identity fields. Empty strings mean the field
/// could not be read; that never fails the account-wide workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub account: String,
    pub nickname: String,
    pub phone: String,
}

/// Fixed layout of the v4 in-memory user-info record, for national
/// 11-digit phone numbers: three 16-byte inline strings, each trailed by
/// a length byte and a 0x0f/0x1f capacity marker, then the phone digits.
static V4_USER_INFO_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s-u).{16}[\x00-\x20]\x00{7}[\x0f\x1f]\x00{7}.{16}[\x00-\x20]\x00{7}[\x0f\x1f]\x00{7}.{16}[\x01-\x20]\x00{7}[\x0f\x1f]\x00{7}[0-9]{11}\x00{5}\x0b\x00{7}\x0f\x00{7}",
    )
    .expect("v4 user info regex compiles")
});

/// Null-terminated UTF-8 at `start` within a fixed window; decoding stops
/// at the first 0x00 and an unterminated window yields an empty string.
pub fn extract_cstring(data: &[u8], start: usize) -> String {
    if start >= data.len() {
        return String::new();
    }
    match data[start..].iter().position(|&b| b == 0) {
        Some(end) => String::from_utf8_lossy(&data[start..start + end]).into_owned(),
        None => String::new(),
    }
}

/// First v4 user-info record in a region buffer. Fields sit at byte
/// offsets 32 (account), 64 (display name), and 96 (phone) of the match.
pub fn find_v4_user_info(buffer: &[u8]) -> Option<UserInfo> {
    let matched = V4_USER_INFO_REGEX.find(buffer)?.as_bytes();
    Some(UserInfo {
        account: extract_cstring(matched, 32),
        nickname: extract_cstring(matched, 64),
        phone: extract_cstring(matched, 96),
    })
}

#[cfg(windows)]
pub use windows_impl::{read_v3_user_info, scan_v4_user_info, V3Recovery};

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::wx_core::decryption::KEY_SIZE;
    use crate::wx_core::memory::{
        produce_regions, worker_count, MemoryRegion, KEY_SCAN_MIN_REGION, MAX_KEY_WORKERS,
        REGION_CHANNEL_CAPACITY,
    };
    use crate::wx_core::offsets::{
        offsets_for, ACCOUNT_OFFSET, KEY_OFFSET, NICKNAME_OFFSET, PHONE_OFFSET,
    };
    use crate::wx_core::utils::{CancelToken, WxCoreResult};
    use crate::wx_core::win_api::{get_module_base_address, ProcessHandle};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use log::{debug, info, warn};

    /// Everything the v3 offset table can hand back in one pass.
    #[derive(Debug, Default)]
    pub struct V3Recovery {
        pub info: UserInfo,
        pub key: Option<[u8; KEY_SIZE]>,
    }

    /// Reads the v3 identity fields and key pointer at their
    /// module-relative offsets. Unlisted builds are skipped with a
    /// warning; individual field failures leave that field empty.
    pub fn read_v3_user_info(pid: u32, full_version: &str) -> WxCoreResult<Option<V3Recovery>> {
        let offsets = match offsets_for(full_version) {
            Some(offsets) => offsets,
            None => {
                warn!(
                    "version {} is not in the offset table, skipping user info",
                    full_version
                );
                return Ok(None);
            }
        };

        let base = get_module_base_address(pid, V3_MODULE_NAME)?;
        debug!("found {} at base address {:#x}", V3_MODULE_NAME, base);

        let handle = ProcessHandle::open(pid)?;
        let mut recovery = V3Recovery::default();

        let read_string = |offset: u64| -> String {
            if offset == 0 {
                return String::new();
            }
            match handle.read_memory(base + offset, V3_STRING_READ_LEN) {
                Ok(bytes) => extract_cstring(&bytes, 0),
                Err(e) => {
                    warn!("user info field read failed: {}", e);
                    String::new()
                }
            }
        };

        recovery.info.nickname = read_string(offsets[NICKNAME_OFFSET]);
        recovery.info.account = read_string(offsets[ACCOUNT_OFFSET]);
        recovery.info.phone = read_string(offsets[PHONE_OFFSET]);

        if offsets[KEY_OFFSET] != 0 {
            recovery.key = read_v3_key(&handle, base + offsets[KEY_OFFSET]);
        }

        Ok(Some(recovery))
    }

    /// Follows the 8-byte little-endian pointer at `address` to the
    /// 32-byte master key.
    fn read_v3_key(handle: &ProcessHandle, address: u64) -> Option<[u8; KEY_SIZE]> {
        let ptr_bytes: [u8; 8] = handle.read_exact(address).ok()?;
        let key_address = u64::from_le_bytes(ptr_bytes);
        if key_address == 0 {
            return None;
        }
        handle.read_exact::<KEY_SIZE>(key_address).ok()
    }

    /// v4 user-info hunt over the same region pipeline as the key scan.
    /// The first worker to match publishes; everyone else stands down.
    pub fn scan_v4_user_info(pid: u32, token: &CancelToken) -> WxCoreResult<Option<UserInfo>> {
        let handle = ProcessHandle::open(pid)?;
        let scan = CancelToken::new();

        let (region_tx, region_rx) = bounded::<MemoryRegion>(REGION_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = bounded::<UserInfo>(1);

        let workers = worker_count(MAX_KEY_WORKERS);
        debug!("starting {} workers for the v4 user info search", workers);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let region_rx = region_rx.clone();
                let result_tx = result_tx.clone();
                let scan = &scan;
                s.spawn(move || info_worker(region_rx, result_tx, token, scan));
            }
            drop(region_rx);
            drop(result_tx);

            s.spawn(|| {
                if !token.is_cancelled() {
                    produce_regions(&handle, KEY_SCAN_MIN_REGION, &region_tx, &scan);
                }
                drop(region_tx);
            });
        });

        if let Ok(found) = result_rx.try_recv() {
            info!("v4 user info matched in memory");
            return Ok(Some(found));
        }
        token.check()?;
        info!("v4 user info scan finished without a match");
        Ok(None)
    }

    fn info_worker(
        region_rx: Receiver<MemoryRegion>,
        result_tx: Sender<UserInfo>,
        token: &CancelToken,
        scan: &CancelToken,
    ) {
        for region in region_rx.iter() {
            if token.is_cancelled() || scan.is_cancelled() {
                return;
            }
            if let Some(found) = find_v4_user_info(&region.bytes) {
                let _ = result_tx.try_send(found);
                scan.cancel();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One 32-byte string field of the v4 record: 16 bytes of content, a
    /// length byte, a capacity marker, zero padding.
    fn field(content: &[u8], cap: u8) -> Vec<u8> {
        assert!(content.len() <= 16);
        let mut f = vec![0u8; 32];
        f[..content.len()].copy_from_slice(content);
        f[16] = content.len() as u8;
        f[24] = cap;
        f
    }

    fn user_info_record(account: &[u8], nickname: &[u8], phone: &[u8]) -> Vec<u8> {
        let mut record = Vec::with_capacity(128);
        record.extend_from_slice(&field(b"wxid_w3wlxi2h", 0x0f));
        record.extend_from_slice(&field(account, 0x0f));
        record.extend_from_slice(&field(nickname, 0x1f));
        record.extend_from_slice(phone);
        record.extend_from_slice(&[0u8; 5]);
        record.push(0x0b);
        record.extend_from_slice(&[0u8; 7]);
        record.push(0x0f);
        record.extend_from_slice(&[0u8; 7]);
        record
    }

    #[test]
    fn v4_record_fields_are_sliced_at_fixed_offsets() {
        let record = user_info_record(b"testaccount", b"Nick", b"13812345678");
        let mut buffer = vec![0xccu8; 500];
        buffer.extend_from_slice(&record);
        buffer.extend_from_slice(&[0xccu8; 300]);

        let info = find_v4_user_info(&buffer).expect("record matches");
        assert_eq!(info.account, "testaccount");
        assert_eq!(info.nickname, "Nick");
        assert_eq!(info.phone, "13812345678");
    }

    #[test]
    fn v4_record_requires_a_nonempty_nickname() {
        // Third field's length byte must be at least 0x01.
        let record = user_info_record(b"testaccount", b"", b"13812345678");
        assert!(find_v4_user_info(&record).is_none());
    }

    #[test]
    fn v4_record_requires_eleven_digits() {
        let record = user_info_record(b"testaccount", b"Nick", b"1381234567a");
        assert!(find_v4_user_info(&record).is_none());

        let junk = vec![0xccu8; 256];
        assert!(find_v4_user_info(&junk).is_none());
    }

    #[test]
    fn cstring_extraction_stops_at_the_first_nul() {
        let data = b"hello\x00world\x00";
        assert_eq!(extract_cstring(data, 0), "hello");
        assert_eq!(extract_cstring(data, 6), "world");
    }

    #[test]
    fn cstring_extraction_handles_windows_without_nul() {
        // No terminator inside the window means no trustworthy string.
        assert_eq!(extract_cstring(b"abcdef", 0), "");
        assert_eq!(extract_cstring(b"abc\x00", 10), "");
    }
}
