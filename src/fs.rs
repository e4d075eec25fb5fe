//! Filesystem abstraction consumed by the journal.
//!
//! The journal never touches `std::fs` directly; it goes through this
//! trait, so that tests can substitute [`MemFs`] for the real filesystem.
//! The atomic-replace technique in [`RealFs::write_atomic`] is lifted
//! straight from a mkstemp-write-rename helper: write to a
//! `mkstemp`-created sibling file, `fchmod` it, then rename it into place.
//! It is used for segment/snapshot bookkeeping but deliberately never for
//! the advisory lock file: a `flock` is tied to the open-file description,
//! not the path, so renaming a fresh inode over an already-locked path
//! would leave the original lock held on an orphaned, unlinked inode while
//! a second opener's `flock` on the new inode trivially succeeds.
//! [`RealFs::lock_exclusive`] instead opens and locks the lock file's
//! existing inode directly and rewrites its body in place, the same
//! open-then-`flock`-that-fd idiom the teacher's own `tools::lock_file`
//! uses.

use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

/// A writable journal file: plain `Write` plus an explicit fsync.
pub trait JournalFile: Write + Send {
    fn sync_all(&mut self) -> io::Result<()>;
}

impl JournalFile for std::fs::File {
    fn sync_all(&mut self) -> io::Result<()> {
        std::fs::File::sync_all(self)
    }
}

/// A held advisory lock. Dropping it releases the lock.
pub trait LockGuard: Send {}

pub trait Fs: Send + Sync {
    /// Create a new file exclusively (fails if it already exists).
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn JournalFile>>;
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    /// File names (not full paths) of the entries directly inside `dir`.
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>>;
    /// Atomically replace the contents of `path` with `data`.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Open (creating if necessary) and `flock` `path`, then overwrite its
    /// contents with `data`. The open and the lock happen on the *same*
    /// file descriptor and the path is never renamed over, so the lock
    /// stays tied to the inode a later opener will also open — unlike
    /// [`Fs::write_atomic`], which replaces the inode on every call and
    /// would let a racing lock acquisition succeed against a fresh,
    /// never-locked file.
    fn lock_exclusive(&self, path: &Path, data: &[u8]) -> io::Result<Box<dyn LockGuard>>;
}

/// Real, on-disk filesystem.
pub struct RealFs;

impl Fs for RealFs {
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn JournalFile>> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            if entry.file_type().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut template = path.to_owned();
        let ext = template
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!("{}.tmp_XXXXXX", e))
            .unwrap_or_else(|| "tmp_XXXXXX".to_string());
        template.set_extension(ext);

        let (fd, tmp_path) = unistd::mkstemp(&template)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let mode = stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH;
        if let Err(err) = stat::fchmod(fd, mode) {
            let _ = unistd::unlink(&tmp_path);
            return Err(io::Error::new(io::ErrorKind::Other, err));
        }

        let write_result = (|| -> io::Result<()> {
            use std::os::unix::io::FromRawFd;
            let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
            file.write_all(data)?;
            file.sync_all()
        })();

        if let Err(err) = write_result {
            let _ = unistd::unlink(&tmp_path);
            return Err(err);
        }

        if let Err(err) = std::fs::rename(&tmp_path, path) {
            let _ = unistd::unlink(&tmp_path);
            return Err(err);
        }

        Ok(())
    }

    fn lock_exclusive(&self, path: &Path, data: &[u8]) -> io::Result<Box<dyn LockGuard>> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        use std::os::unix::io::AsRawFd;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, e))?;

        // Only the lock holder ever gets here, so rewriting the body in
        // place (rather than through `write_atomic`'s rename) cannot race.
        use std::io::{Seek, SeekFrom};
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(data)?;
        file.sync_all()?;

        struct RealLockGuard {
            _file: std::fs::File,
        }
        impl LockGuard for RealLockGuard {}
        impl Drop for RealLockGuard {
            fn drop(&mut self) {
                use std::os::unix::io::AsRawFd;
                let _ = flock(self._file.as_raw_fd(), FlockArg::Unlock);
            }
        }

        Ok(Box::new(RealLockGuard { _file: file }))
    }
}

/// In-memory filesystem double, for tests.
#[derive(Clone, Default)]
pub struct MemFs {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    locks: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemWriter {
    path: PathBuf,
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(self.path.clone()).or_default();
        entry.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl JournalFile for MemWriter {
    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemLockGuard {
    path: PathBuf,
    locks: Arc<Mutex<HashSet<PathBuf>>>,
}
impl LockGuard for MemLockGuard {}
impl Drop for MemLockGuard {
    fn drop(&mut self) {
        self.locks.lock().unwrap().remove(&self.path);
    }
}

impl Fs for MemFs {
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn JournalFile>> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "file exists"));
        }
        files.insert(path.to_owned(), Vec::new());
        drop(files);
        Ok(Box::new(MemWriter { path: path.to_owned(), files: self.files.clone() }))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?
            .clone();
        Ok(Box::new(Cursor::new(data)))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .remove(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        files.insert(to.to_owned(), data);
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let files = self.files.lock().unwrap();
        let mut names = Vec::new();
        for path in files.keys() {
            if path.parent() == Some(dir) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.files.lock().unwrap().insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn lock_exclusive(&self, path: &Path, data: &[u8]) -> io::Result<Box<dyn LockGuard>> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.insert(path.to_owned()) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "already locked"));
        }
        drop(locks);
        self.files.lock().unwrap().insert(path.to_owned(), data.to_vec());
        Ok(Box::new(MemLockGuard { path: path.to_owned(), locks: self.locks.clone() }))
    }
}
