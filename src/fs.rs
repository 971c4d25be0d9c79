use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// The subset of file metadata the server makes decisions on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub is_regular_file: bool,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch
    pub modified_at_millis: u64,
}

impl From<&fs::Metadata> for FileMetadata {
    fn from(metadata: &fs::Metadata) -> Self {
        let modified_at_millis = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);

        Self {
            is_regular_file: metadata.is_file(),
            size: metadata.len(),
            modified_at_millis,
        }
    }
}

/// Raw filesystem primitives the server is built on
pub trait FileSystem: Send + Sync {
    /// Stat a path, following symlinks
    fn stat(&self, path: &Path) -> io::Result<FileMetadata>;

    /// Open a fresh read stream for a path
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

/// `FileSystem` backed by the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn stat(&self, path: &Path) -> io::Result<FileMetadata> {
        let metadata = fs::metadata(path)?;
        Ok(FileMetadata::from(&metadata))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }
}
