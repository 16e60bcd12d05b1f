//! Drop storage.
//!
//! A stored resource is written once and destroyed by its first complete
//! read. Reads take an exclusive advisory lock, overwrite every chunk with
//! random bytes right after reading it, and unlink the file when done.
//! Writes go to a hidden staging file that is published with a hard link,
//! which fails rather than overwriting an existing resource.

use rand::RngCore;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Upper bound on a single transfer chunk.
pub const MAX_CHUNK: usize = 4096;

/// Largest power of two not exceeding `min(remaining, MAX_CHUNK)`.
/// Zero when nothing remains.
pub fn chunk_size(remaining: u64) -> usize {
    let cap = remaining.min(MAX_CHUNK as u64);
    if cap == 0 {
        return 0;
    }
    1usize << (63 - cap.leading_zeros())
}

/// Errors from the storage layer.
#[derive(Debug)]
pub enum StoreError {
    /// Nothing is stored at the path (or it is a directory).
    NotFound,
    /// Something is already stored at the path.
    Conflict,
    /// Another transfer holds the lock.
    Locked,
    Io(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "resource not found"),
            StoreError::Conflict => write!(f, "resource already exists"),
            StoreError::Locked => write!(f, "resource is locked"),
            StoreError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound,
            _ => StoreError::Io(e),
        }
    }
}

/// An open file holding an exclusive `flock`. Unlocked on drop.
#[derive(Debug)]
struct LockedFile {
    file: File,
}

impl LockedFile {
    /// Take the lock without blocking.
    fn lock(file: File) -> Result<Self, StoreError> {
        // SAFETY: the descriptor is owned by `file` and open.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Self { file });
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Err(StoreError::Locked)
        } else {
            Err(StoreError::Io(err))
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; it closes after this returns.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            trace!(error = %io::Error::last_os_error(), "Unlock failed");
        }
    }
}

/// A read-once transfer out of storage.
///
/// Dropping a retrieval, finished or not, unlinks the resource and releases
/// the lock.
#[derive(Debug)]
pub struct Retrieval {
    path: PathBuf,
    file: Option<LockedFile>,
    len: u64,
    offset: u64,
}

impl Retrieval {
    /// Open and lock the resource at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => return Err(StoreError::NotFound),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let locked = LockedFile::lock(file)?;

        // A reader that finished while we waited to open has already unlinked it.
        let meta = locked.file.metadata()?;
        if meta.nlink() == 0 {
            return Err(StoreError::NotFound);
        }

        debug!(path = %path.display(), len = meta.len(), "Opened resource for retrieval");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(locked),
            len: meta.len(),
            offset: 0,
        })
    }

    /// Total size of the resource.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes not yet returned.
    pub fn remaining(&self) -> u64 {
        self.len - self.offset
    }

    /// Read the next chunk, shred it on disk and return the original bytes.
    /// `Ok(None)` once everything has been read.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let size = chunk_size(self.remaining());
        if size == 0 {
            return Ok(None);
        }
        let locked = self
            .file
            .as_ref()
            .ok_or_else(|| StoreError::Io(io::Error::other("retrieval already finished")))?;
        let file = &locked.file;

        let mut chunk = vec![0u8; size];
        file.read_exact_at(&mut chunk, self.offset)?;

        let mut noise = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut noise);
        file.write_all_at(&noise, self.offset)?;
        file.sync_data()?;

        self.offset += size as u64;
        Ok(Some(chunk))
    }

    /// Unlink the resource and release the lock.
    pub fn finish(mut self) {
        self.release();
    }

    /// Release the lock but keep the resource. Once a chunk has been read
    /// this is the same as dropping.
    pub fn cancel(mut self) {
        if self.offset == 0 {
            drop(self.file.take());
            debug!(path = %self.path.display(), "Retrieval cancelled");
        }
    }

    fn release(&mut self) {
        let Some(locked) = self.file.take() else {
            return;
        };
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to unlink resource"),
        }
        drop(locked);
        trace!(path = %self.path.display(), sent = self.offset, "Retrieval released");
    }
}

impl Drop for Retrieval {
    fn drop(&mut self) {
        self.release();
    }
}

/// A store-once transfer into storage.
///
/// The body lands in a staging file beside the target. Dropping an upload
/// that was not committed removes the staging file.
#[derive(Debug)]
pub struct Upload {
    target: PathBuf,
    staging: PathBuf,
    file: Option<LockedFile>,
    remaining: u64,
}

impl Upload {
    /// Start storing `len` bytes at `target`.
    pub fn create(target: &Path, len: u64) -> Result<Self, StoreError> {
        match fs::symlink_metadata(target) {
            Ok(_) => return Err(StoreError::Conflict),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }

        let staging = staging_path(target)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .map_err(StoreError::Io)?;

        // From here on Drop removes the staging file on any failure.
        let mut upload = Self {
            target: target.to_path_buf(),
            staging,
            file: None,
            remaining: len,
        };
        upload.file = Some(LockedFile::lock(file)?);

        debug!(path = %target.display(), len, "Created upload");
        Ok(upload)
    }

    /// Bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Append a chunk and sync it to disk.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if data.len() as u64 > self.remaining {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk exceeds declared length",
            )));
        }
        let locked = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Io(io::Error::other("upload already closed")))?;

        locked.file.write_all(data)?;
        locked.file.flush()?;
        locked.file.sync_data()?;
        self.remaining -= data.len() as u64;
        Ok(())
    }

    /// Release the lock, close the file and publish it at the target path.
    /// Fails with `Conflict` if the target appeared in the meantime.
    pub fn commit(mut self) -> Result<(), StoreError> {
        if self.remaining != 0 {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upload is incomplete",
            )));
        }
        drop(self.file.take());

        match fs::hard_link(&self.staging, &self.target) {
            Ok(()) => {
                debug!(path = %self.target.display(), "Published resource");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::Conflict),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.staging) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.staging.display(), error = %e, "Failed to remove staging file");
            }
        }
    }
}

/// `dir/.name.<random>.part` beside the target.
fn staging_path(target: &Path) -> Result<PathBuf, StoreError> {
    let name = target
        .file_name()
        .ok_or(StoreError::Conflict)?
        .to_string_lossy();
    let tag: u64 = rand::random();
    Ok(target.with_file_name(format!(".{}.{:016x}.part", name, tag)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fresh directory under the system temp dir.
    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sdrop-{}-{}-{:08x}",
            tag,
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn store(path: &Path, data: &[u8]) {
        let mut upload = Upload::create(path, data.len() as u64).unwrap();
        let mut rest = data;
        while !rest.is_empty() {
            let n = chunk_size(rest.len() as u64);
            upload.write_chunk(&rest[..n]).unwrap();
            rest = &rest[n..];
        }
        upload.commit().unwrap();
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(0), 0);
        assert_eq!(chunk_size(1), 1);
        assert_eq!(chunk_size(2), 2);
        assert_eq!(chunk_size(3), 2);
        assert_eq!(chunk_size(1000), 512);
        assert_eq!(chunk_size(4096), 4096);
        assert_eq!(chunk_size(10_000), 4096);
    }

    #[test]
    fn test_store_then_retrieve_once() {
        let dir = scratch_dir("store");
        let path = dir.join("note");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        store(&path, &data);
        assert_eq!(entries(&dir), vec!["note".to_string()]);

        let mut retrieval = Retrieval::open(&path).unwrap();
        assert_eq!(retrieval.len(), data.len() as u64);
        let mut out = Vec::new();
        while let Some(chunk) = retrieval.next_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        retrieval.finish();

        assert_eq!(out, data);
        assert!(!path.exists());
        assert!(matches!(Retrieval::open(&path), Err(StoreError::NotFound)));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_chunks_are_shredded() {
        let dir = scratch_dir("shred");
        let path = dir.join("secret");
        let data = vec![b'A'; 6000];
        store(&path, &data);

        // A second name keeps the inode reachable after unlink.
        let witness = dir.join("witness");
        fs::hard_link(&path, &witness).unwrap();

        let mut retrieval = Retrieval::open(&path).unwrap();
        let first = retrieval.next_chunk().unwrap().unwrap();
        assert_eq!(first.len(), 4096);
        assert_eq!(first, vec![b'A'; 4096]);

        // Mid-stream, the sent region no longer holds the plaintext.
        let on_disk = fs::read(&witness).unwrap();
        assert_ne!(&on_disk[..4096], &data[..4096]);
        assert_eq!(&on_disk[4096..], &data[4096..]);

        while retrieval.next_chunk().unwrap().is_some() {}
        retrieval.finish();

        let on_disk = fs::read(&witness).unwrap();
        assert_eq!(on_disk.len(), data.len());
        assert_ne!(on_disk, data);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_retrieve_missing_or_directory() {
        let dir = scratch_dir("missing");
        assert!(matches!(Retrieval::open(&dir.join("nope")), Err(StoreError::NotFound)));
        assert!(matches!(Retrieval::open(&dir), Err(StoreError::NotFound)));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_concurrent_retrieval_is_locked() {
        let dir = scratch_dir("locked");
        let path = dir.join("file");
        store(&path, b"payload");

        let first = Retrieval::open(&path).unwrap();
        assert!(matches!(Retrieval::open(&path), Err(StoreError::Locked)));
        first.cancel();
        assert!(path.exists());

        // Dropping unlinks even without reading.
        drop(Retrieval::open(&path).unwrap());
        assert!(!path.exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_upload_refuses_existing() {
        let dir = scratch_dir("exists");
        let path = dir.join("taken");
        fs::write(&path, b"old").unwrap();
        assert!(matches!(Upload::create(&path, 3), Err(StoreError::Conflict)));
        assert_eq!(fs::read(&path).unwrap(), b"old");
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_commit_loses_race() {
        let dir = scratch_dir("race");
        let path = dir.join("target");

        let mut first = Upload::create(&path, 3).unwrap();
        let mut second = Upload::create(&path, 3).unwrap();
        first.write_chunk(b"one").unwrap();
        second.write_chunk(b"two").unwrap();

        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(StoreError::Conflict)));

        assert_eq!(fs::read(&path).unwrap(), b"one");
        assert_eq!(entries(&dir), vec!["target".to_string()]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_aborted_upload_leaves_nothing() {
        let dir = scratch_dir("abort");
        let path = dir.join("partial");

        let mut upload = Upload::create(&path, 10).unwrap();
        upload.write_chunk(b"half").unwrap();
        assert_eq!(upload.remaining(), 6);
        assert!(upload.commit().is_err());

        assert!(entries(&dir).is_empty());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let dir = scratch_dir("oversize");
        let mut upload = Upload::create(&dir.join("small"), 2).unwrap();
        assert!(upload.write_chunk(b"toolong").is_err());
        drop(upload);
        fs::remove_dir_all(dir).unwrap();
    }
}
