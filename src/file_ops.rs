use crate::models::FileMeta;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Capability to open the content of one file as a byte stream.
///
/// Opening happens on the worker's blocking thread, never on the dispatcher.
pub trait FileSource: Send + 'static {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

impl<F> FileSource for F
where
    F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + 'static,
{
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        self()
    }
}

/// A file on the local file system.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FileSource for LocalFile {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let f = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(f)))
    }
}

/// Exclusive handle to a job's file content. Moved into the worker that runs the job.
pub struct FileHandle(Box<dyn FileSource>);

impl FileHandle {
    pub fn new(source: impl FileSource) -> Self {
        Self(Box::new(source))
    }

    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        self.0.open()
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileHandle(..)")
    }
}

/// Snapshot the metadata of a local file, ready for submission.
pub fn file_meta(path: &Path) -> Result<FileMeta> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    let modified = metadata
        .modified()
        .with_context(|| format!("no modification time for {}", path.display()))?;
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(FileMeta {
        name,
        path: canonical.to_string_lossy().into_owned(),
        size: metadata.len(),
        last_modified: truncate_to_millis(DateTime::<Utc>::from(modified)),
    })
}

// Records store milliseconds; compare at the same precision.
fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_meta_reads_size_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let meta = file_meta(&path).unwrap();
        assert_eq!(meta.name, "data.bin");
        assert_eq!(meta.size, 11);
        assert_eq!(meta.last_modified.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn file_meta_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_meta(dir.path()).is_err());
    }

    #[test]
    fn local_file_opens_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"abc").unwrap();

        let handle = FileHandle::new(LocalFile::new(&path));
        let mut s = String::new();
        handle.open().unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "abc");
    }

    #[test]
    fn closures_act_as_sources() {
        let handle = FileHandle::new(|| -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(io::Cursor::new(vec![1u8, 2, 3])))
        });
        let mut buf = Vec::new();
        handle.open().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
    }
}
