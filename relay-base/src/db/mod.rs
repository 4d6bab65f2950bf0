use std::path::PathBuf;
use std::{io, path::Path, sync::Arc};

use rocksdb::{Direction, IteratorMode, Options, WriteOptions, DB as Rocks};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

pub use rocksdb::WriteBatch;

/// Database test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[derive(Debug, Clone)]
/// A KV Store. Every write is synced to disk before it returns so that a
/// successful write survives an ungraceful shutdown.
pub struct DB(Arc<Rocks>);

impl From<Rocks> for DB {
    fn from(rocks: Rocks) -> Self {
        Self(Arc::new(rocks))
    }
}

/// DB Error type
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// Rocks DB Error
    #[error("{0}")]
    RockError(#[from] rocksdb::Error),
    #[error("Failed to open {path}, canonicalized as {canonicalized}: {source}")]
    /// Error opening the database
    OpeningError {
        /// Rocksdb error during opening
        #[source]
        source: rocksdb::Error,
        /// Raw database path provided
        path: PathBuf,
        /// Parsed path used
        canonicalized: PathBuf,
    },
    /// Could not parse the provided database path string
    #[error("Invalid database path supplied {1:?}; {0}")]
    InvalidDbPath(#[source] io::Error, String),
    /// A stored value could not be encoded or decoded
    #[error("Failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// DB result type
pub type DbResult<T> = std::result::Result<T, DbError>;

fn sync_write_options() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl DB {
    /// Opens db at `db_path` and creates if missing
    #[tracing::instrument(err)]
    pub fn from_path(db_path: &Path) -> DbResult<DB> {
        let path = {
            let mut path = db_path
                .parent()
                .unwrap_or(Path::new("."))
                .canonicalize()
                .map_err(|e| DbError::InvalidDbPath(e, db_path.to_string_lossy().into()))?;
            if let Some(file_name) = db_path.file_name() {
                path.push(file_name);
            }
            path
        };

        if path.is_dir() {
            info!(path=%path.to_string_lossy(), "Opening existing db")
        } else {
            info!(path=%path.to_string_lossy(), "Creating db")
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);

        Rocks::open(&opts, &path)
            .map_err(|e| DbError::OpeningError {
                source: e,
                path: db_path.into(),
                canonicalized: path,
            })
            .map(Into::into)
    }

    /// Store a value in the DB
    pub fn store(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        Ok(self.0.put_opt(key, value, &sync_write_options())?)
    }

    /// Retrieve a value from the DB
    pub fn retrieve(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.0.get(key)?)
    }

    /// Delete a value from the DB
    pub fn delete(&self, key: &[u8]) -> DbResult<()> {
        Ok(self.0.delete_opt(key, &sync_write_options())?)
    }

    /// Apply a batch of writes atomically
    pub fn write(&self, batch: WriteBatch) -> DbResult<()> {
        Ok(self.0.write_opt(batch, &sync_write_options())?)
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn prefix_entries(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = vec![];
        for item in self
            .0
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }
        Ok(entries)
    }

    /// Store a value encoded as JSON
    pub fn store_json<V: Serialize>(&self, key: &[u8], value: &V) -> DbResult<()> {
        self.store(key, &serde_json::to_vec(value)?)
    }

    /// Retrieve a JSON encoded value
    pub fn retrieve_json<V: DeserializeOwned>(&self, key: &[u8]) -> DbResult<Option<V>> {
        self.retrieve(key)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(Into::into)
    }
}
