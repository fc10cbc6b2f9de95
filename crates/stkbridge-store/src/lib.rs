//! stkbridge-store - Firmware images kept on disk
//!
//! Every image is stored as `<name>-<version>.bin` with a JSON sidecar
//! `<name>-<version>.json` describing it. Versions are allocated per name,
//! starting at 1, and a stored version is never overwritten. Files are
//! written under a temporary name and renamed into place, so a crash never
//! leaves a half written image behind; leftover temporaries are removed on
//! open.

pub mod error;

pub use error::{Result, StoreError};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const TMP_SUFFIX: &str = ".tmp";

/// Metadata of one stored image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareImage {
    /// Image name, e.g. the sketch name
    pub name: String,
    /// Version, allocated by the store
    pub version: u32,
    /// Length in bytes
    pub length: u64,
    /// CRC-32 of the image bytes
    pub crc32: u32,
    /// Seconds since the Unix epoch when the image was stored
    pub stored_at: u64,
}

impl FirmwareImage {
    /// File name without extension
    pub fn stem(&self) -> String {
        stem(&self.name, self.version)
    }
}

fn stem(name: &str, version: u32) -> String {
    format!("{}-{}", name, version)
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Directory of firmware images
#[derive(Debug, Clone)]
pub struct FirmwareStore {
    root: PathBuf,
    capacity_bytes: Option<u64>,
}

impl FirmwareStore {
    /// Open (creating if needed) the store rooted at `root`
    ///
    /// `capacity_bytes` caps the total size of stored images.
    pub fn open(root: impl Into<PathBuf>, capacity_bytes: Option<u64>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                log::warn!("store: Removing leftover {}", path.display());
                fs::remove_file(&path)?;
            }
        }

        log::debug!("store: Opened {}", root.display());
        Ok(Self {
            root,
            capacity_bytes,
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Total bytes of stored images
    pub fn used_bytes(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|image| image.length).sum())
    }

    /// Store a new version of `name`
    ///
    /// The version is one past the highest stored version of `name`.
    pub fn store(&self, name: &str, data: &[u8]) -> Result<FirmwareImage> {
        check_name(name)?;

        let images = self.list()?;
        if let Some(capacity) = self.capacity_bytes {
            let used: u64 = images.iter().map(|image| image.length).sum();
            let available = capacity.saturating_sub(used);
            if data.len() as u64 > available {
                return Err(StoreError::StorageFull {
                    needed: data.len() as u64,
                    available,
                });
            }
        }

        let version = images
            .iter()
            .filter(|image| image.name == name)
            .map(|image| image.version)
            .max()
            .unwrap_or(0)
            + 1;

        let image = FirmwareImage {
            name: name.to_string(),
            version,
            length: data.len() as u64,
            crc32: crc32fast::hash(data),
            stored_at: now_secs(),
        };

        // Image first: a sidecar never points at a missing image
        let stem = image.stem();
        self.write_atomic(&format!("{}.bin", stem), data)?;
        let sidecar = serde_json::to_vec_pretty(&image)?;
        self.write_atomic(&format!("{}.json", stem), &sidecar)?;

        log::info!(
            "store: Stored {} ({} bytes, CRC 0x{:08X})",
            stem,
            image.length,
            image.crc32
        );
        Ok(image)
    }

    /// Load the most recently stored version of `name`
    pub fn load(&self, name: &str) -> Result<(FirmwareImage, Vec<u8>)> {
        let latest = self
            .list()?
            .into_iter()
            .filter(|image| image.name == name)
            .max_by_key(|image| image.version)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.read_image(latest)
    }

    /// Load one specific version
    pub fn load_version(&self, name: &str, version: u32) -> Result<(FirmwareImage, Vec<u8>)> {
        check_name(name)?;
        let image = self
            .metadata(name, version)
            .map_err(|_| StoreError::NotFound(stem(name, version)))?;
        self.read_image(image)
    }

    /// All stored images, ordered by name then version
    pub fn list(&self) -> Result<Vec<FirmwareImage>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map(|bytes| serde_json::from_slice::<FirmwareImage>(&bytes)) {
                Ok(Ok(image)) => images.push(image),
                Ok(Err(e)) => log::warn!("store: Skipping {}: {}", path.display(), e),
                Err(e) => log::warn!("store: Skipping {}: {}", path.display(), e),
            }
        }
        images.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(images)
    }

    /// Delete one stored version
    pub fn remove(&self, name: &str, version: u32) -> Result<()> {
        check_name(name)?;
        let stem = stem(name, version);
        let sidecar = self.root.join(format!("{}.json", stem));
        if !sidecar.exists() {
            return Err(StoreError::NotFound(stem));
        }
        fs::remove_file(&sidecar)?;
        let bin = self.root.join(format!("{}.bin", stem));
        if bin.exists() {
            fs::remove_file(bin)?;
        }
        log::info!("store: Removed {}", stem);
        Ok(())
    }

    fn metadata(&self, name: &str, version: u32) -> Result<FirmwareImage> {
        let path = self.root.join(format!("{}.json", stem(name, version)));
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn read_image(&self, image: FirmwareImage) -> Result<(FirmwareImage, Vec<u8>)> {
        let stem = image.stem();
        let data = match fs::read(self.root.join(format!("{}.bin", stem))) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Corrupt(stem));
            }
            Err(e) => return Err(e.into()),
        };

        if data.len() as u64 != image.length || crc32fast::hash(&data) != image.crc32 {
            log::error!("store: {} does not match its metadata", stem);
            return Err(StoreError::Corrupt(stem));
        }
        Ok((image, data))
    }

    fn write_atomic(&self, file_name: &str, data: &[u8]) -> Result<()> {
        let path = self.root.join(file_name);
        let tmp = self.root.join(format!("{}{}", file_name, TMP_SUFFIX));
        let write_error = |source| StoreError::StorageWriteError {
            path: path.display().to_string(),
            source,
        };

        let mut file = fs::File::create(&tmp).map_err(write_error)?;
        file.write_all(data).map_err(write_error)?;
        file.sync_all().map_err(write_error)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(write_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: Option<u64>) -> (tempfile::TempDir, FirmwareStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FirmwareStore::open(dir.path(), capacity).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_and_load() {
        let (_dir, store) = store(None);
        let data = vec![0x0C, 0x94, 0x5C, 0x00];
        let saved = store.store("blink", &data).unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(saved.length, 4);
        assert_eq!(saved.crc32, crc32fast::hash(&data));

        let (image, loaded) = store.load("blink").unwrap();
        assert_eq!(image, saved);
        assert_eq!(loaded, data);
        assert!(store.root().join("blink-1.bin").exists());
        assert!(store.root().join("blink-1.json").exists());
    }

    #[test]
    fn test_versions_never_overwrite() {
        let (_dir, store) = store(None);
        store.store("blink", &[1]).unwrap();
        let second = store.store("blink", &[2, 2]).unwrap();
        store.store("other", &[9]).unwrap();
        assert_eq!(second.version, 2);

        let (image, data) = store.load("blink").unwrap();
        assert_eq!(image.version, 2);
        assert_eq!(data, vec![2, 2]);

        let (_, data) = store.load_version("blink", 1).unwrap();
        assert_eq!(data, vec![1]);

        let listed: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|i| (i.name, i.version))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("blink".to_string(), 1),
                ("blink".to_string(), 2),
                ("other".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_capacity() {
        let (_dir, store) = store(Some(100));
        store.store("a", &[0; 60]).unwrap();
        assert!(matches!(
            store.store("b", &[0; 50]),
            Err(StoreError::StorageFull {
                needed: 50,
                available: 40
            })
        ));
        store.remove("a", 1).unwrap();
        store.store("b", &[0; 50]).unwrap();
        assert_eq!(store.used_bytes().unwrap(), 50);
    }

    #[test]
    fn test_corrupt_image_detected() {
        let (_dir, store) = store(None);
        store.store("blink", &[1, 2, 3, 4]).unwrap();
        fs::write(store.root().join("blink-1.bin"), [1, 2, 3, 5]).unwrap();
        assert!(matches!(store.load("blink"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_missing_and_invalid_names() {
        let (_dir, store) = store(None);
        assert!(matches!(store.load("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.store("../evil", &[0]),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(store.remove("nope", 1), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store(None);
        store.store("blink", &[1]).unwrap();
        store.remove("blink", 1).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!store.root().join("blink-1.bin").exists());
    }

    #[test]
    fn test_open_sweeps_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blink-1.bin.tmp"), [0u8; 8]).unwrap();
        let store = FirmwareStore::open(dir.path(), None).unwrap();
        assert!(!store.root().join("blink-1.bin.tmp").exists());
        assert!(store.list().unwrap().is_empty());
    }
}
