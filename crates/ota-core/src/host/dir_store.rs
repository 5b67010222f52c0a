//! Directory-backed [`KvStore`].
//!
//! Keys are plain file names inside one directory. Writes go to a hidden temp
//! file in the same directory, are synced, then renamed over the key, so a
//! reader sees either the old or the new content.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use ota_common::record::is_valid_slot_name;

use super::KvStore;

/// Flat key/value store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open the store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DirStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a key.
    pub fn path_of(&self, name: &str) -> io::Result<PathBuf> {
        if !is_valid_slot_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid slot name: {:?}", name),
            ));
        }
        Ok(self.root.join(name))
    }

    /// Stream `reader` into `name` atomically, returning the bytes written.
    pub fn write_from(&self, name: &str, reader: &mut dyn Read) -> io::Result<u64> {
        let target = self.path_of(name)?;
        let temp = self.root.join(format!(
            ".{}.tmp.{}",
            name,
            uuid::Uuid::new_v4().simple()
        ));

        let result = (|| {
            let mut file = File::create(&temp)?;
            let written = io::copy(reader, &mut file)?;
            file.flush()?;
            file.sync_all()?;
            fs::rename(&temp, &target)?;
            Ok(written)
        })();

        match result {
            Ok(written) => {
                self.sync_dir();
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                Err(e)
            }
        }
    }

    /// Persist directory entries (renames, creations) where supported.
    fn sync_dir(&self) {
        #[cfg(unix)]
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }
    }
}

impl KvStore for DirStore {
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(name)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let mut reader = bytes;
        self.write_from(name, &mut reader).map(|_| ())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.path_of(from)?, self.path_of(to)?)?;
        self.sync_dir();
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_of(name)?) {
            Ok(()) => {
                self.sync_dir();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, name: &str) -> io::Result<bool> {
        self.path_of(name)?.try_exists()
    }
}
