//! Disk abstraction: stat/read/write/mkdir/remove.
//!
//! The scanner and the build driver only touch the disk through the
//! FileSystem trait, so tests can substitute the in-memory MemFs and drive
//! whole builds without a real filesystem.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// MTime info gathered for a file.  This also models "file is absent".
/// Timestamps are nanoseconds since an arbitrary epoch and are only ever
/// compared against each other.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Missing,
    Stamp(u64),
}

impl MTime {
    /// The representation persisted in the logs; missing files record 0.
    pub fn to_raw(self) -> u64 {
        match self {
            MTime::Missing => 0,
            MTime::Stamp(t) => t,
        }
    }

    pub fn from_raw(raw: u64) -> MTime {
        if raw == 0 {
            MTime::Missing
        } else {
            MTime::Stamp(raw)
        }
    }
}

pub trait FileSystem {
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &str) -> std::io::Result<MTime>;
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
    fn write(&self, path: &str, content: &[u8]) -> std::io::Result<()>;
    /// Create the directories a path's containing directory needs to exist.
    fn create_parent_dirs(&self, path: &str) -> std::io::Result<()>;
    /// Remove a file; removing an already-absent file is not an error.
    fn remove(&self, path: &str) -> std::io::Result<()>;
}

pub struct RealFileSystem {}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

fn system_time_nanos(t: SystemTime) -> u64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as u64,
        Err(_) => 0, // pre-epoch mtimes are indistinguishable from ancient
    }
}

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        Ok(match std::fs::metadata(path) {
            Ok(meta) => MTime::Stamp(system_time_nanos(meta.modified()?)),
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    MTime::Missing
                } else {
                    return Err(err);
                }
            }
        })
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &str, content: &[u8]) -> std::io::Result<()> {
        std::fs::write(path, content)
    }

    fn create_parent_dirs(&self, path: &str) -> std::io::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

struct MemFile {
    content: Vec<u8>,
    mtime: u64,
}

/// In-memory FileSystem implementation, the test double for RealFileSystem.
/// Writes tick a fake clock so that ordering-sensitive logic (restat, stale
/// deps) can be exercised deterministically.
pub struct MemFs {
    files: RefCell<HashMap<String, MemFile>>,
    clock: std::cell::Cell<u64>,
}

impl MemFs {
    pub fn new() -> Self {
        MemFs {
            files: RefCell::new(HashMap::new()),
            clock: std::cell::Cell::new(1),
        }
    }

    /// Advance and return the fake clock.
    pub fn tick(&self) -> u64 {
        let now = self.clock.get() + 1;
        self.clock.set(now);
        now
    }

    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mtime = self.tick();
        self.files.borrow_mut().insert(
            path.to_string(),
            MemFile {
                content: content.into(),
                mtime,
            },
        );
    }

    /// Bump a file's mtime without changing its content.
    pub fn touch(&self, path: &str) {
        let mtime = self.tick();
        let mut files = self.files.borrow_mut();
        match files.get_mut(path) {
            Some(f) => f.mtime = mtime,
            None => {
                files.insert(
                    path.to_string(),
                    MemFile {
                        content: Vec::new(),
                        mtime,
                    },
                );
            }
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).map(|f| f.content.clone())
    }
}

impl FileSystem for MemFs {
    fn stat(&self, path: &str) -> std::io::Result<MTime> {
        Ok(match self.files.borrow().get(path) {
            Some(f) => MTime::Stamp(f.mtime),
            None => MTime::Missing,
        })
    }

    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        match self.files.borrow().get(path) {
            Some(f) => Ok(f.content.clone()),
            None => Err(std::io::Error::from(ErrorKind::NotFound)),
        }
    }

    fn write(&self, path: &str, content: &[u8]) -> std::io::Result<()> {
        self.add_file(path, content.to_vec());
        Ok(())
    }

    fn create_parent_dirs(&self, _path: &str) -> std::io::Result<()> {
        Ok(())
    }

    fn remove(&self, path: &str) -> std::io::Result<()> {
        self.files.borrow_mut().remove(path);
        Ok(())
    }
}
