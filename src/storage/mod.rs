//! The storage facade: lifecycle, the heading page and the public map API.
//!
//! A storage is a directory holding the `info` sidecar and the paged file.
//! Page 0 is the heading, page 1 the first free-space map page, and the
//! access-method root starts at page 2. All public operations serialize on an
//! internal mutex; the advisory file lock is held from open to close.

use std::fs;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fsm::FreeSpaceMap;
use crate::page::headers::{AccessMethod, HeadingPageHeader};
use crate::page::{page_size_is_valid, MIN_PAGE_SIZE, NIL_PAGE};
use crate::store::{PageStore, STORAGE_FILE_NAME};
use crate::tree::Tree;

pub mod info;

use info::{StorageInfo, ON_DISK_STRUCTURE_VERSION};

/// Default page size of newly created storages.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default page cache capacity, in pages.
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Options for creating or opening a [`Storage`].
pub struct Options {
    page_size: Option<usize>,
    cache_pages: usize,
}

impl Options {
    /// Options with the default page size and cache capacity.
    pub fn new() -> Options {
        Options {
            page_size: None,
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }

    /// Set the page size: a power of two between 4096 and 65536.
    ///
    /// On create this fixes the storage's page size (default 4096). On open
    /// it is cross-checked against the file, which fails with
    /// [`Error::NotSupported`] on mismatch; leaving it unset adopts the
    /// file's page size.
    pub fn page_size(&mut self, page_size: usize) {
        self.page_size = Some(page_size);
    }

    /// Set the page cache capacity in pages.
    ///
    /// May not be zero.
    pub fn cache_pages(&mut self, cache_pages: usize) {
        assert!(cache_pages > 0);
        self.cache_pages = cache_pages;
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}

struct OpenState {
    store: PageStore,
    fsm: FreeSpaceMap,
    heading: HeadingPageHeader,
    poisoned: bool,
}

impl OpenState {
    fn tree(&mut self) -> Tree<'_> {
        Tree::new(&mut self.store, &mut self.fsm, &mut self.heading)
    }
}

struct Inner {
    path: PathBuf,
    state: Option<OpenState>,
}

/// An embedded key-value storage over a B+Tree access method.
///
/// Keys and values are byte strings; keys are ordered lexicographically.
/// Callers may share a storage across threads, but operations execute one at
/// a time.
///
/// Durability is flush-on-demand: mutations may reside in the page cache
/// until [`Storage::flush`] or [`Storage::close`]. There is no journaling; a
/// crash between flushes can leave the storage unopenable.
pub struct Storage {
    inner: Mutex<Inner>,
}

impl Storage {
    /// Create a new storage at `path`, failing if one already exists there.
    pub fn create_new(path: impl AsRef<Path>, options: Options) -> Result<Storage> {
        let path = path.as_ref();
        let page_size = options.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !page_size_is_valid(page_size) {
            return Err(Error::NotSupported(format!(
                "page size {page_size} is not a power of two in [{MIN_PAGE_SIZE}, 65536]"
            )));
        }

        fs::create_dir_all(path)?;
        if !PageStore::can_create(path) || path.join(info::INFO_FILE_NAME).exists() {
            return Err(Error::DuplicateStorage(path.to_path_buf()));
        }

        StorageInfo::current().write(path)?;
        let mut store = PageStore::create_new_space(path, page_size, options.cache_pages)?;
        store.lock()?;

        let mut heading = HeadingPageHeader {
            page_size: page_size as u32,
            structure_version: ON_DISK_STRUCTURE_VERSION,
            access_method: AccessMethod::BPlusTree,
            fsm_page_index: 1,
            access_method_page_index: NIL_PAGE,
        };
        let mut page = store.create_page()?;
        heading.encode_to(&mut page);
        store.update_page(page)?;

        let mut fsm = FreeSpaceMap::create(&mut store)?;
        debug_assert_eq!(heading.fsm_page_index, 1);
        Tree::new(&mut store, &mut fsm, &mut heading).init_root()?;
        store.flush()?;

        log::info!(
            "created storage at {} with page size {page_size}",
            path.display()
        );
        Ok(Storage {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                state: Some(OpenState {
                    store,
                    fsm,
                    heading,
                    poisoned: false,
                }),
            }),
        })
    }

    /// Open the storage at `path`, validating the sidecar and the heading.
    pub fn open_existing(path: impl AsRef<Path>, options: Options) -> Result<Storage> {
        let path = path.as_ref();
        let info = StorageInfo::read(path)?;
        info.validate()?;

        let page_size = sniff_page_size(path)?;
        if !page_size_is_valid(page_size) {
            return Err(Error::StorageFormat(format!(
                "heading declares invalid page size {page_size}"
            )));
        }
        if let Some(requested) = options.page_size {
            if requested != page_size {
                return Err(Error::NotSupported(format!(
                    "page size {requested} requested, storage uses {page_size}"
                )));
            }
        }

        let mut store = PageStore::open_existing_space(path, page_size, options.cache_pages)?;
        store.lock()?;

        let page = store.fetch_page(0)?;
        let heading = HeadingPageHeader::decode(&page)?;
        if heading.structure_version != ON_DISK_STRUCTURE_VERSION {
            return Err(Error::NotSupported(format!(
                "on-disk structure version {} (supported: {ON_DISK_STRUCTURE_VERSION})",
                heading.structure_version
            )));
        }
        if heading.access_method != AccessMethod::BPlusTree {
            return Err(Error::NotSupported(format!(
                "access method {:?}",
                heading.access_method
            )));
        }

        let mut fsm = FreeSpaceMap::open(&mut store, heading.fsm_page_index)?;
        let root_class = fsm.get_class(&mut store, heading.access_method_page_index)?;
        if !root_class.is_class() {
            return Err(Error::StorageFormat(format!(
                "tree root page {} is not tracked as a data page ({root_class:?})",
                heading.access_method_page_index
            )));
        }

        log::info!(
            "opened storage at {} with page size {page_size}, {} pages",
            path.display(),
            store.page_count()
        );
        Ok(Storage {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                state: Some(OpenState {
                    store,
                    fsm,
                    heading,
                    poisoned: false,
                }),
            }),
        })
    }

    /// Open the storage at `path`, creating it first when absent.
    pub fn open_or_create(path: impl AsRef<Path>, options: Options) -> Result<Storage> {
        let path = path.as_ref();
        if path.join(STORAGE_FILE_NAME).exists() {
            Storage::open_existing(path, options)
        } else {
            Storage::create_new(path, options)
        }
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_op(|state| state.tree().lookup(key))
    }

    /// Insert or overwrite the value under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_op(|state| state.tree().insert(key, value))
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.write_op(|state| state.tree().remove(key))
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.read_op(|state| state.tree().contains(key))
    }

    /// The number of stored entries.
    pub fn count(&self) -> Result<u64> {
        self.read_op(|state| state.tree().count())
    }

    /// The smallest stored key.
    pub fn first_key(&self) -> Result<Option<Vec<u8>>> {
        self.read_op(|state| state.tree().first_key())
    }

    /// The largest stored key.
    pub fn last_key(&self) -> Result<Option<Vec<u8>>> {
        self.read_op(|state| state.tree().last_key())
    }

    /// The smallest stored key strictly greater than `key`.
    pub fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_op(|state| state.tree().next_key(key))
    }

    /// The largest stored key strictly less than `key`.
    pub fn previous_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_op(|state| state.tree().previous_key(key))
    }

    /// All `(key, value)` pairs with `lower <= key` and, when given,
    /// `key < upper`, in ascending key order.
    pub fn scan_range(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.read_op(|state| {
            let mut tree = state.tree();
            let iter = tree.range(lower, upper)?;
            iter.collect()
        })
    }

    /// Force every pending mutation to stable storage.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        log::trace!("flushing storage at {}", inner.path.display());
        let state = inner.state.as_mut().ok_or(Error::NotOpen)?;
        state.store.flush()
    }

    /// Flush, release the file lock and drop the page store. Further
    /// operations fail with [`Error::NotOpen`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(mut state) = inner.state.take() else {
            return Ok(());
        };
        let flushed = state.store.flush();
        state.store.unlock();
        log::info!("closed storage at {}", inner.path.display());
        flushed
    }

    /// Whether the storage is open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().state.is_some()
    }

    /// The storage's page size.
    pub fn page_size(&self) -> Result<usize> {
        self.read_op(|state| Ok(state.store.page_size()))
    }

    /// The number of pages in the backing file, cached growth included.
    pub fn page_count(&self) -> Result<i64> {
        self.read_op(|state| Ok(state.store.page_count()))
    }

    fn read_op<T>(&self, f: impl FnOnce(&mut OpenState) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let state = inner.state.as_mut().ok_or(Error::NotOpen)?;
        f(state)
    }

    fn write_op<T>(&self, f: impl FnOnce(&mut OpenState) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let state = inner.state.as_mut().ok_or(Error::NotOpen)?;
        if state.poisoned {
            return Err(Error::StorageFormat(
                "storage is read-only after a failed write; reopen it".into(),
            ));
        }
        let result = f(state);
        if let Err(Error::StorageFormat(_) | Error::Io(_)) = &result {
            // No rollback: partial page edits may be in the cache, so further
            // writes are refused until the storage is reopened.
            state.poisoned = true;
            log::error!("write failed, storage switched to read-only mode");
        }
        result
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(mut state) = inner.state.take() {
            if let Err(e) = state.store.flush() {
                log::warn!(
                    "flush on drop failed for storage at {}: {e}",
                    inner.path.display()
                );
            }
            state.store.unlock();
        }
    }
}

/// Read the heading's page-size field before the page size is known, using
/// the smallest legal page as the probe length.
fn sniff_page_size(dir: &Path) -> Result<usize> {
    let path = dir.join(STORAGE_FILE_NAME);
    let file = fs::File::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::StorageFormat(format!("paged file missing at {}", path.display()))
        }
        _ => Error::Io(e),
    })?;
    let mut probe = [0u8; MIN_PAGE_SIZE];
    file.read_exact_at(&mut probe, 0).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            Error::StorageFormat("paged file is shorter than one page".into())
        }
        _ => Error::Io(e),
    })?;
    let at = HeadingPageHeader::PAGE_SIZE_OFFSET;
    // UNWRAP: the probe covers the fixed heading offsets.
    Ok(u32::from_le_bytes(probe[at..at + 4].try_into().unwrap()) as usize)
}
