//! # quorum-storage
//!
//! why: give each consensus peer a durable home for its state blob
//! relations: quorum-core encodes (term, vote, log) into one opaque blob and
//! hands it here before any reply that depends on it leaves the peer
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

/// trait for durable storage of an opaque consensus state blob
///
/// the blob's encoding is owned entirely by the caller; this layer only
/// promises that a successful `save_state` is readable after a crash.
/// handles are shared (`&self`) so one store can outlive a peer restart.
pub trait Storage: Send + Sync {
    /// durably replace the stored blob
    fn save_state(&self, data: &[u8]) -> io::Result<()>;

    /// load the stored blob; an empty vec means no state was ever saved
    fn load_state(&self) -> io::Result<Vec<u8>>;

    /// drop all persisted state (for testing)
    fn clear(&self) -> io::Result<()>;
}

// -- file storage implementation --

/// file-based storage using std::fs
///
/// keeps a single `raft_state.bin` in the given directory. writes go to a
/// temp file, are fsynced, then renamed over the live file, so a crash
/// mid-save leaves either the old blob or the new one, never a torn mix.
pub struct FileStorage {
    /// directory holding the state file
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft_state.bin")
    }
}

impl Storage for FileStorage {
    fn save_state(&self, data: &[u8]) -> io::Result<()> {
        // atomic write: temp file, fsync, then rename
        let temp_path = self.dir.join("raft_state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        Ok(())
    }

    fn load_state(&self) -> io::Result<Vec<u8>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(Vec::new()); // fresh peer, nothing saved yet
        }
        fs::read(path)
    }

    fn clear(&self) -> io::Result<()> {
        let _ = fs::remove_file(self.state_path());
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// interior mutability lets a test keep one handle across a simulated crash
/// and restart, which is exactly what a persister must survive.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<Vec<u8>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_state(&self, data: &[u8]) -> io::Result<()> {
        *self.state.lock() = data.to_vec();
        Ok(())
    }

    fn load_state(&self) -> io::Result<Vec<u8>> {
        Ok(self.state.lock().clone())
    }

    fn clear(&self) -> io::Result<()> {
        self.state.lock().clear();
        Ok(())
    }
}
