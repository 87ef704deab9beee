use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::wx_core::decryption::DbVersion;
use crate::wx_core::utils::exists;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

pub const V3_PROCESS_NAME: &str = "WeChat";
pub const V4_PROCESS_NAME: &str = "Weixin";

/// Per-root user directories that never hold account data.
const SPECIAL_DIRS: [&str; 3] = ["All Users", "Applet", "WMPF"];

/// One WeChat identity: what was discovered about it on disk and, while
/// its process is online, the keys recovered from memory. Keys stay in
/// their output encodings (upper hex, `0X..`, ASCII) end to end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    pub wxid: String,
    pub wx_account: String,
    pub nickname: String,
    pub phone: String,
    pub version: u32,
    pub full_version: String,
    pub data_dir: String,
    pub key: String,
    pub image_xor_key: String,
    pub image_aes_key: String,
    #[serde(rename = "PID")]
    pub pid: u32,
    pub exe_path: String,
    pub status: String,
}

impl Account {
    pub fn db_version(&self) -> Option<DbVersion> {
        DbVersion::from_number(self.version)
    }

    pub fn is_online(&self) -> bool {
        self.status == STATUS_ONLINE
    }

    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}

/// v4 user directories carry a disambiguating suffix after the wxid
/// (`wxid_xxx_786d`); strip everything after the last underscore.
pub fn handle_wxid_v4(dir_name: &str) -> String {
    match dir_name.rfind('_') {
        Some(idx) => dir_name[..idx].to_string(),
        None => dir_name.to_string(),
    }
}

pub fn format_xor_key(key: u8) -> String {
    format!("0X{:02X}", key)
}

pub fn parse_xor_key(formatted: &str) -> Option<u8> {
    let hex_part = formatted.strip_prefix("0X").or_else(|| formatted.strip_prefix("0x"))?;
    u8::from_str_radix(hex_part, 16).ok()
}

/// Scans the given WeChat root directories for per-user data directories
/// and returns an offline [`Account`] for every one that holds a
/// reference database.
pub fn discover_offline_accounts(roots: &[PathBuf]) -> Vec<Account> {
    let mut accounts = Vec::new();

    for root in roots {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                info!("cannot read WeChat dir {}: {}", root.display(), e);
                continue;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if SPECIAL_DIRS.contains(&name.as_str()) {
                continue;
            }
            let user_dir = entry.path();
            if !user_dir.is_dir() {
                continue;
            }

            let account = if exists(user_dir.join(DbVersion::V3.reference_db())) {
                Account {
                    wxid: name,
                    version: 3,
                    data_dir: user_dir.to_string_lossy().into_owned(),
                    status: STATUS_OFFLINE.to_string(),
                    ..Default::default()
                }
            } else if exists(user_dir.join(DbVersion::V4.reference_db())) {
                Account {
                    wxid: handle_wxid_v4(&name),
                    version: 4,
                    data_dir: user_dir.to_string_lossy().into_owned(),
                    status: STATUS_OFFLINE.to_string(),
                    ..Default::default()
                }
            } else {
                continue;
            };
            accounts.push(account);
        }
    }

    accounts
}

/// Among several candidate data directories of one version, a live
/// account is the one still writing to its reference database.
pub fn pick_freshest_data_dir(candidates: &[&Account]) -> Option<usize> {
    let mut best: Option<(usize, std::time::SystemTime)> = None;
    for (idx, account) in candidates.iter().enumerate() {
        let version = match account.db_version() {
            Some(version) => version,
            None => continue,
        };
        let db_path = Path::new(&account.data_dir).join(version.reference_db());
        let modified = match fs::metadata(&db_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if best.map_or(true, |(_, t)| modified > t) {
            best = Some((idx, modified));
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(windows)]
pub use windows_impl::{list_accounts, wechat_root_dirs};

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::wx_core::decryption::KEY_SIZE;
    use crate::wx_core::image_key::{find_xor_key, scan_aes_key};
    use crate::wx_core::key_scanner::scan_master_key;
    use crate::wx_core::user_info::{read_v3_user_info, scan_v4_user_info};
    use crate::wx_core::utils::{CancelToken, WxCoreError, WxCoreResult};
    use crate::wx_core::validator::Validator;
    use crate::wx_core::win_api::{
        documents_dir, get_file_version_info, get_process_exe_path, home_dir, list_processes,
        read_registry_sz_value,
    };
    use crate::wx_core::utils::unique;
    use log::{debug, warn};
    use std::collections::HashSet;

    const WECHAT_REG_KEY: &str = "Software\\Tencent\\WeChat";
    const WECHAT_REG_VALUE: &str = "FileSavePath";

    /// WeChat root directories, from the registry and the known user
    /// folders. v3 and v4 roots can coexist, so all of them come back.
    pub fn wechat_root_dirs() -> Vec<PathBuf> {
        let mut save_dir = match read_registry_sz_value(WECHAT_REG_KEY, WECHAT_REG_VALUE) {
            Ok(value) => Some(PathBuf::from(value)),
            Err(e) => {
                debug!("FileSavePath not in registry: {}", e);
                documents_dir()
            }
        };
        if save_dir.as_deref() == Some(Path::new("MyDocument:")) {
            save_dir = home_dir();
        }

        let mut roots: Vec<String> = Vec::new();
        if let Some(dir) = &save_dir {
            for sub in ["WeChat Files", "xwechat_files"] {
                let candidate = dir.join(sub);
                if exists(&candidate) {
                    roots.push(candidate.to_string_lossy().into_owned());
                }
            }
            // Some v4 installs keep xwechat_files next to Documents.
            if let Some(parent) = dir.parent() {
                let candidate = parent.join("xwechat_files");
                if exists(&candidate) {
                    roots.push(candidate.to_string_lossy().into_owned());
                }
            }
        }
        if let Some(home) = home_dir() {
            let candidate = home.join("xwechat_files");
            if exists(&candidate) {
                roots.push(candidate.to_string_lossy().into_owned());
            }
        }

        unique(roots).into_iter().map(PathBuf::from).collect()
    }

    fn client_version(process_name: &str) -> Option<u32> {
        match process_name {
            V3_PROCESS_NAME => Some(3),
            V4_PROCESS_NAME => Some(4),
            _ => None,
        }
    }

    /// Live client processes as online accounts. v4 spawns helper
    /// processes under the same executable name; children whose parent is
    /// also a client process are dropped.
    fn find_online_accounts() -> WxCoreResult<Vec<Account>> {
        let processes = list_processes()?;
        let client_pids: HashSet<u32> = processes
            .iter()
            .filter(|p| client_version(p.name.trim_end_matches(".exe")).is_some())
            .map(|p| p.pid)
            .collect();

        let mut accounts = Vec::new();
        for process in &processes {
            let name = process.name.trim_end_matches(".exe");
            let version = match client_version(name) {
                Some(version) => version,
                None => continue,
            };
            if client_pids.contains(&process.parent_pid) {
                debug!("skipping helper process {} (pid {})", process.name, process.pid);
                continue;
            }

            let exe_path = match get_process_exe_path(process.pid) {
                Ok(path) => path,
                Err(e) => {
                    info!("exe path lookup failed for pid {}: {}", process.pid, e);
                    continue;
                }
            };
            let full_version = match get_file_version_info(&exe_path) {
                Ok(version) => version,
                Err(e) => {
                    info!("version lookup failed for {}: {}", exe_path, e);
                    continue;
                }
            };

            accounts.push(Account {
                version,
                full_version,
                pid: process.pid,
                exe_path,
                status: STATUS_ONLINE.to_string(),
                ..Default::default()
            });
        }
        Ok(accounts)
    }

    /// All accounts on this workstation: every live client process plus
    /// every on-disk data directory, merged by wxid. Live accounts borrow
    /// the identity of the data directory they are still writing to.
    pub fn list_accounts() -> WxCoreResult<Vec<Account>> {
        let mut online = find_online_accounts()?;
        info!("found {} live client process(es)", online.len());

        let roots = wechat_root_dirs();
        info!("probing WeChat root dirs: {:?}", roots);
        let offline = discover_offline_accounts(&roots);

        for account in online.iter_mut() {
            let same_version: Vec<&Account> = offline
                .iter()
                .filter(|a| a.version == account.version)
                .collect();
            let picked = match same_version.len() {
                0 => None,
                1 => Some(0),
                _ => pick_freshest_data_dir(&same_version),
            };
            if let Some(idx) = picked {
                account.wxid = same_version[idx].wxid.clone();
                account.data_dir = same_version[idx].data_dir.clone();
            } else {
                warn!(
                    "no data directory found for live pid {} (v{})",
                    account.pid, account.version
                );
            }
        }

        let online_wxids: HashSet<String> =
            online.iter().map(|a| a.wxid.clone()).collect();
        let mut accounts = online;
        for account in offline {
            if !online_wxids.contains(&account.wxid) {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    impl Account {
        /// Recovers the master key (and for v4 the image keys) from the
        /// live process, filling in user info on the way. Requires the
        /// account to be online.
        pub fn recover_keys(&mut self, token: &CancelToken) -> WxCoreResult<()> {
            if !self.key.is_empty() {
                return Ok(());
            }
            if !self.is_online() {
                return Err(WxCoreError::NotOnline);
            }
            let version = self
                .db_version()
                .ok_or_else(|| WxCoreError::UnsupportedVersion(self.version.to_string()))?;
            if self.data_dir.is_empty() {
                return Err(WxCoreError::InvalidPath(
                    "no data directory for this account".to_string(),
                ));
            }

            let validator = Validator::new(version, self.data_dir_path())?;
            debug!(
                "validating v{} candidates against {}",
                validator.version().number(),
                validator.db_path().display()
            );

            match version {
                DbVersion::V3 => self.recover_v3(&validator, token),
                DbVersion::V4 => self.recover_v4(&validator, token),
            }
        }

        fn set_key(&mut self, key: &[u8; KEY_SIZE]) {
            self.key = hex::encode_upper(key);
        }

        fn recover_v3(
            &mut self,
            validator: &Validator,
            token: &CancelToken,
        ) -> WxCoreResult<()> {
            match read_v3_user_info(self.pid, &self.full_version) {
                Ok(Some(recovery)) => {
                    self.nickname = recovery.info.nickname;
                    self.wx_account = recovery.info.account;
                    self.phone = recovery.info.phone;
                    if let Some(key) = recovery.key {
                        if validator.validate(&key) {
                            self.set_key(&key);
                            return Ok(());
                        }
                        warn!("offset-table key failed validation, falling back to memory hunt");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("v3 user info extraction failed: {}", e),
            }

            if let Some(key) = scan_master_key(self.pid, validator, token)? {
                self.set_key(&key);
            }
            Ok(())
        }

        fn recover_v4(
            &mut self,
            validator: &Validator,
            token: &CancelToken,
        ) -> WxCoreResult<()> {
            match scan_v4_user_info(self.pid, token) {
                Ok(Some(info)) => {
                    self.wx_account = info.account;
                    self.nickname = info.nickname;
                    self.phone = info.phone;
                }
                Ok(None) => {}
                Err(e) => warn!("v4 user info scan failed: {}", e),
            }

            if let Some(key) = scan_master_key(self.pid, validator, token)? {
                self.set_key(&key);
            }

            if let Some(xor_key) = find_xor_key(self.data_dir_path()) {
                self.image_xor_key = format_xor_key(xor_key);
            }
            if let Some(aes_key) = scan_aes_key(self.pid, &self.data_dir_path(), token)? {
                self.image_aes_key = aes_key;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn v4_wxid_drops_the_directory_suffix() {
        assert_eq!(handle_wxid_v4("wxid_b1hl7ty6bdn922_786d"), "wxid_b1hl7ty6bdn922");
        assert_eq!(handle_wxid_v4("plain"), "plain");
    }

    #[test]
    fn xor_key_formatting_round_trips() {
        assert_eq!(format_xor_key(0x5a), "0X5A");
        assert_eq!(parse_xor_key("0X5A"), Some(0x5a));
        assert_eq!(parse_xor_key("0x07"), Some(0x07));
        assert_eq!(parse_xor_key("5A"), None);
        assert_eq!(parse_xor_key("0XZZ"), None);
    }

    #[test]
    fn serialized_field_names_match_the_output_contract() {
        let account = Account {
            wxid: "wxid_x".into(),
            pid: 4321,
            status: STATUS_OFFLINE.into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&account).unwrap();
        for field in [
            "Wxid",
            "WxAccount",
            "Nickname",
            "Phone",
            "Version",
            "FullVersion",
            "DataDir",
            "Key",
            "ImageXorKey",
            "ImageAesKey",
            "PID",
            "ExePath",
            "Status",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(value["PID"], 4321);
    }

    #[test]
    fn offline_discovery_finds_both_versions_and_skips_special_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("wxid_aaa/Msg")).unwrap();
        fs::write(root.join("wxid_aaa/Msg/Misc.db"), b"x").unwrap();

        fs::create_dir_all(root.join("wxid_bbb_9f21/db_storage/message")).unwrap();
        fs::write(
            root.join("wxid_bbb_9f21/db_storage/message/message_0.db"),
            b"x",
        )
        .unwrap();

        fs::create_dir_all(root.join("All Users/Msg")).unwrap();
        fs::write(root.join("All Users/Msg/Misc.db"), b"x").unwrap();
        fs::create_dir_all(root.join("no_db_here")).unwrap();

        let mut accounts = discover_offline_accounts(&[root.to_path_buf()]);
        accounts.sort_by(|a, b| a.wxid.cmp(&b.wxid));

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].wxid, "wxid_aaa");
        assert_eq!(accounts[0].version, 3);
        assert_eq!(accounts[0].status, STATUS_OFFLINE);
        assert_eq!(accounts[1].wxid, "wxid_bbb");
        assert_eq!(accounts[1].version, 4);
    }

    #[test]
    fn freshest_data_dir_prefers_recent_writes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["old", "new"] {
            fs::create_dir_all(root.join(name).join("Msg")).unwrap();
            fs::write(root.join(name).join("Msg/Misc.db"), b"x").unwrap();
        }
        // Push one reference DB into the past.
        let old_db = root.join("old/Msg/Misc.db");
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = fs::File::options().write(true).open(&old_db).unwrap();
        file.set_modified(past).unwrap();
        drop(file);

        let accounts: Vec<Account> = ["old", "new"]
            .iter()
            .map(|name| Account {
                wxid: name.to_string(),
                version: 3,
                data_dir: root.join(name).to_string_lossy().into_owned(),
                ..Default::default()
            })
            .collect();
        let refs: Vec<&Account> = accounts.iter().collect();
        let picked = pick_freshest_data_dir(&refs).unwrap();
        assert_eq!(accounts[picked].wxid, "new");
    }
}
