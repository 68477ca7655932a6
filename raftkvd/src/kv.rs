//! Key-value layer
//!
//! The engine abstraction ([`KvStorage`]) the committed write batches are
//! applied to, and the raw API [`Server`] sitting on top of it.
mod engine;
mod server;

use raftkv_api::{Modify, WireError};
use thiserror::Error;

pub use self::engine::*;
pub use self::server::*;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("invalid snapshot data: {0}")]
    Snapshot(#[from] WireError),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Storage engine with column families
pub trait KvStorage {
    type Reader: StorageReader;

    /// Consistent, read-only view of the current data
    fn reader(&self) -> KvResult<Self::Reader>;

    /// Apply all modifications atomically, in order
    fn write(&self, batch: Vec<Modify>) -> KvResult<()>;
}

pub trait StorageReader {
    type Iter: CfIterator;

    fn get_cf(&self, cf: &str, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    /// Iterator over `cf`, positioned at its first key
    fn iter_cf(&self, cf: &str) -> Self::Iter;
}

/// Cursor over the keys of a single column family, in order
///
/// Released when dropped.
pub trait CfIterator {
    /// Position at the first key `>= key`
    fn seek(&mut self, key: &[u8]);

    fn valid(&self) -> bool;

    /// Current key-value pair; `None` if not [`Self::valid`]
    fn item(&self) -> Option<(&[u8], &[u8])>;

    #[allow(clippy::should_implement_trait)]
    fn next(&mut self);
}
