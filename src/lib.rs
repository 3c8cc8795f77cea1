#![warn(missing_docs)]

//! DataTanker: an embedded, single-process key-value storage engine.
//!
//! A storage persists an ordered map of byte-string keys to byte-string
//! values in a local directory, layered bottom-up as a paged file, a
//! free-space map, a blob allocator for out-of-line values, and a B+Tree
//! access method with range scans and ordered navigation.
//!
//! ```no_run
//! use datatanker::{Options, Storage};
//!
//! # fn main() -> datatanker::Result<()> {
//! let storage = Storage::open_or_create("my_db", Options::new())?;
//! storage.put(b"alpha", b"1")?;
//! assert_eq!(storage.get(b"alpha")?, Some(b"1".to_vec()));
//! storage.flush()?;
//! # Ok(())
//! # }
//! ```

mod blob;
mod error;
mod fsm;
mod page;
mod storage;
mod store;
mod tree;

pub use error::{Error, Result};
pub use storage::{Options, Storage, DEFAULT_CACHE_PAGES, DEFAULT_PAGE_SIZE};
