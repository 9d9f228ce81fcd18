use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;

use crate::DataStore;

/// Store backed by an OS file opened RDONLY or RDWR.
pub struct FileStore {
    file: File,
    writable: bool,
}

impl FileStore {
    /// Create (or truncate) a file and wrap it read-write
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        debug!("FileStore create: {}", path.as_ref().display());
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    /// Open an existing file
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> io::Result<Self> {
        debug!(
            "FileStore open: {} (read_only={})",
            path.as_ref().display(),
            read_only
        );
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self {
            file,
            writable: !read_only,
        })
    }

    pub fn from_file(file: File, writable: bool) -> Self {
        Self { file, writable }
    }

    pub fn into_file(self) -> File {
        self.file
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "store opened read-only",
            ))
        }
    }
}

impl DataStore for FileStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        self.file.write_at(buf, offset)
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.check_writable()?;
        self.file.set_len(size)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("data_store_{}_{}", std::process::id(), name))
    }

    #[test]
    fn round_trip() -> io::Result<()> {
        let path = temp_path("round_trip");
        let mut store = FileStore::create(&path)?;
        store.write_all_at(10, b"hello")?;
        assert_eq!(store.len()?, 15);
        let mut buf = [0u8; 5];
        store.read_exact_at(10, &mut buf)?;
        assert_eq!(&buf, b"hello");
        store.truncate(12)?;
        assert_eq!(store.len()?, 12);
        store.sync()?;
        drop(store);
        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn read_only_rejects_writes() -> io::Result<()> {
        let path = temp_path("read_only");
        let mut store = FileStore::create(&path)?;
        store.write_all_at(0, b"data")?;
        drop(store);

        let mut store = FileStore::open(&path, true)?;
        let mut buf = [0u8; 4];
        store.read_exact_at(0, &mut buf)?;
        assert_eq!(&buf, b"data");
        assert!(store.write_at(0, b"x").is_err());
        assert!(store.truncate(0).is_err());
        drop(store);
        std::fs::remove_file(path)?;
        Ok(())
    }
}
