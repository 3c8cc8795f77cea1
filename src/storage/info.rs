//! The `info` sidecar: a UTF-8 `key=value` file identifying the storage.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// File name of the sidecar inside a storage directory.
pub const INFO_FILE_NAME: &str = "info";

/// The engine-type discriminator written by this implementation.
pub const STORAGE_TYPE_TAG: &str = "DataTanker.BPlusTreeKeyValueStorage";

/// On-disk structure version produced and accepted by this crate.
pub const ON_DISK_STRUCTURE_VERSION: u32 = 1;

/// Parsed contents of the sidecar.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub storage_type: String,
    pub structure_version: u32,
}

impl StorageInfo {
    pub fn current() -> StorageInfo {
        StorageInfo {
            storage_type: STORAGE_TYPE_TAG.to_string(),
            structure_version: ON_DISK_STRUCTURE_VERSION,
        }
    }

    /// Write the sidecar into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let contents = format!(
            "StorageClrTypeName={}\nOnDiskStructureVersion={}\n",
            self.storage_type, self.structure_version
        );
        fs::write(dir.join(INFO_FILE_NAME), contents)?;
        Ok(())
    }

    /// Read and parse the sidecar of `dir`. A missing or unparseable file is
    /// a format error; unknown keys are ignored.
    pub fn read(dir: &Path) -> Result<StorageInfo> {
        let path = dir.join(INFO_FILE_NAME);
        let contents = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::StorageFormat(format!("info file missing at {}", path.display()))
            }
            _ => Error::Io(e),
        })?;

        let mut storage_type = None;
        let mut structure_version = None;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::StorageFormat(format!(
                    "malformed info line: {line:?}"
                )));
            };
            match key {
                "StorageClrTypeName" => storage_type = Some(value.to_string()),
                "OnDiskStructureVersion" => {
                    structure_version = Some(value.parse::<u32>().map_err(|_| {
                        Error::StorageFormat(format!("malformed structure version: {value:?}"))
                    })?)
                }
                _ => {}
            }
        }

        Ok(StorageInfo {
            storage_type: storage_type
                .ok_or_else(|| Error::StorageFormat("info file lacks StorageClrTypeName".into()))?,
            structure_version: structure_version.unwrap_or(ON_DISK_STRUCTURE_VERSION),
        })
    }

    /// Reject engines this implementation cannot open.
    pub fn validate(&self) -> Result<()> {
        if self.storage_type != STORAGE_TYPE_TAG {
            return Err(Error::NotSupported(format!(
                "storage type {:?} is not {STORAGE_TYPE_TAG:?}",
                self.storage_type
            )));
        }
        if self.structure_version != ON_DISK_STRUCTURE_VERSION {
            return Err(Error::NotSupported(format!(
                "on-disk structure version {} (supported: {ON_DISK_STRUCTURE_VERSION})",
                self.structure_version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from("test").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn write_read_validate() {
        let dir = test_dir("info_round_trip");
        StorageInfo::current().write(&dir).unwrap();
        let info = StorageInfo::read(&dir).unwrap();
        assert_eq!(info.storage_type, STORAGE_TYPE_TAG);
        info.validate().unwrap();
    }

    #[test]
    fn missing_file_is_a_format_error() {
        let dir = test_dir("info_missing");
        assert!(matches!(
            StorageInfo::read(&dir),
            Err(Error::StorageFormat(_))
        ));
    }

    #[test]
    fn foreign_engine_is_not_supported() {
        let dir = test_dir("info_foreign");
        let info = StorageInfo {
            storage_type: "SomeOtherEngine".into(),
            structure_version: ON_DISK_STRUCTURE_VERSION,
        };
        info.write(&dir).unwrap();
        let info = StorageInfo::read(&dir).unwrap();
        assert!(matches!(info.validate(), Err(Error::NotSupported(_))));
    }
}
