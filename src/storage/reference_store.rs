use crate::common::config::StorageConfig;
use crate::common::{paths, UnlockError, Result};
use crate::core::verifier::ReferenceDescriptor;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-only lookup of enrolled references by identity.
pub trait ReferenceStore: Send + Sync {
    fn fetch(&self, identity: &str) -> Result<ReferenceDescriptor>;
}

/// `<dir>/<identity>.bincode` files, handed over as opaque bytes.
pub struct FilesystemReferenceStore {
    data_dir: PathBuf,
}

impl FilesystemReferenceStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    /// Per-user data directory of the platform.
    pub fn platform_default() -> Result<Self> {
        let dirs = ProjectDirs::from("com", "faceunlock", "FaceUnlock")
            .ok_or_else(|| UnlockError::Storage("Failed to get project dirs".into()))?;
        Ok(Self::new(dirs.data_dir().join("users")))
    }

    /// Configured directory first, then the dev or system location. A host
    /// without the system directory falls back to the platform data dir.
    pub fn from_config(config: &StorageConfig, dev_mode: bool) -> Result<Self> {
        if let Some(dir) = &config.reference_dir {
            return Ok(Self::new(dir));
        }
        if dev_mode {
            return Ok(Self::new(paths::dev_reference_dir()));
        }
        let system = paths::system_reference_dir();
        if system.exists() {
            Ok(Self::new(system))
        } else {
            Self::platform_default()
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn reference_path(&self, identity: &str) -> Result<PathBuf> {
        let valid = !identity.is_empty()
            && identity.len() <= 64
            && identity != "."
            && identity != ".."
            && identity.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(UnlockError::Storage(format!("Invalid identity: {:?}", identity)));
        }
        Ok(self.data_dir.join(format!("{}.bincode", identity)))
    }
}

impl ReferenceStore for FilesystemReferenceStore {
    fn fetch(&self, identity: &str) -> Result<ReferenceDescriptor> {
        let path = self.reference_path(identity)?;
        if !path.exists() {
            return Err(UnlockError::ReferenceNotFound(identity.to_string()));
        }

        let data = fs::read(&path)?;
        tracing::debug!("Loaded reference for {} ({} bytes) from {:?}", identity, data.len(), path);
        Ok(ReferenceDescriptor::new(identity, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_returns_bytes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alice.bincode"), [1u8, 2, 3, 4]).unwrap();

        let store = FilesystemReferenceStore::new(dir.path());
        let reference = store.fetch("alice").unwrap();
        assert_eq!(reference.identity(), "alice");
        assert_eq!(reference.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_identity_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemReferenceStore::new(dir.path());
        assert!(matches!(store.fetch("nobody"), Err(UnlockError::ReferenceNotFound(_))));
    }

    #[test]
    fn test_configured_dir_wins() {
        let config = StorageConfig { reference_dir: Some(PathBuf::from("/srv/refs")) };
        let store = FilesystemReferenceStore::from_config(&config, true).unwrap();
        assert_eq!(store.data_dir(), Path::new("/srv/refs"));

        let store = FilesystemReferenceStore::from_config(&StorageConfig::default(), true).unwrap();
        assert_eq!(store.data_dir(), paths::dev_reference_dir());
    }

    #[test]
    fn test_path_traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemReferenceStore::new(dir.path());
        for identity in ["../etc/passwd", "a/b", "", ".."] {
            assert!(matches!(store.fetch(identity), Err(UnlockError::Storage(_))), "{}", identity);
        }
    }
}
