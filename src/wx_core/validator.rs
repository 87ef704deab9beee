use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::wx_core::decryption::{DbParams, DbVersion};
use crate::wx_core::utils::{WxCoreError, WxCoreResult};

/// Key validator bound to the first page of a reference encrypted
/// database. Candidate keys from the memory scanners are accepted iff
/// they recover that page's MAC.
pub struct Validator {
    version: DbVersion,
    db_path: PathBuf,
    params: DbParams,
    first_page: Vec<u8>,
}

impl Validator {
    /// Opens the version-specific reference database below `data_dir`
    /// (`Msg/Misc.db` for v3, `db_storage/message/message_0.db` for v4).
    pub fn new(version: DbVersion, data_dir: impl AsRef<Path>) -> WxCoreResult<Self> {
        let db_path = data_dir.as_ref().join(version.reference_db());
        Self::with_file(version, db_path)
    }

    pub fn with_file(version: DbVersion, db_path: impl AsRef<Path>) -> WxCoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let params = version.params();

        let mut first_page = vec![0u8; params.page_size];
        let mut file = File::open(&db_path)?;
        file.read_exact(&mut first_page).map_err(|_| {
            WxCoreError::Malformed(format!(
                "'{}' is shorter than one page",
                db_path.display()
            ))
        })?;

        Ok(Self {
            version,
            db_path,
            params,
            first_page,
        })
    }

    pub fn version(&self) -> DbVersion {
        self.version
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn validate(&self, key: &[u8]) -> bool {
        self.params.validate_page1(&self.first_page, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wx_core::decryption::tests::encrypt_file;
    use crate::wx_core::decryption::{KEY_SIZE, SALT_SIZE};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn validator_uses_reference_db_layout() {
        let master = [0x31u8; KEY_SIZE];
        let salt = [0x09u8; SALT_SIZE];
        let params = DbVersion::V3.params();
        let body = vec![0u8; params.page_size - params.reserve - SALT_SIZE];
        let encrypted = encrypt_file(DbVersion::V3, &master, &salt, &[body]);

        let dir = tempdir().unwrap();
        let data_dir = dir.path();
        fs::create_dir_all(data_dir.join("Msg")).unwrap();
        fs::write(data_dir.join("Msg/Misc.db"), &encrypted).unwrap();

        let validator = Validator::new(DbVersion::V3, data_dir).unwrap();
        assert!(validator.validate(&master));
        assert!(!validator.validate(&[0x32u8; KEY_SIZE]));
        assert!(!validator.validate(&master[..16]));
    }

    #[test]
    fn missing_reference_db_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Validator::new(DbVersion::V4, dir.path()).is_err());
    }
}
