use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing has been written under the requested key.
    #[error("state key does not exist")]
    NotExist,
    #[error("state i/o: {0}")]
    Io(#[from] io::Error),
}

/// Opaque byte store keyed by frontend-supplied profile identifiers. The
/// agent never interprets the bytes except through the prefs serializer.
pub trait StateStore: Send + Sync {
    fn read_state(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn write_state(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

impl StateStore for MemStore {
    fn read_state(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.data.lock().get(key).cloned().ok_or(StoreError::NotExist)
    }

    fn write_state(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.data.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One file per key under a directory the embedding process picks.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> FileStore {
        FileStore { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are opaque; make them filesystem-safe without interpreting them.
        let name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.state", name))
    }
}

impl StateStore for FileStore {
    fn read_state(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotExist),
            Err(err) => Err(err.into()),
        }
    }

    fn write_state(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), bytes)?;
        Ok(())
    }
}
