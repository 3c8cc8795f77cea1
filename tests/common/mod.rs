use std::path::PathBuf;

use datatanker::{Options, Storage};

/// A fresh directory under `test/` for the named test, cleaned on entry.
pub fn test_dir(name: &str) -> PathBuf {
    let path = PathBuf::from("test").join(name);
    let _ = std::fs::remove_dir_all(&path);
    path
}

#[allow(dead_code)]
pub fn create(name: &str) -> (PathBuf, Storage) {
    let path = test_dir(name);
    let storage = Storage::create_new(&path, Options::new()).unwrap();
    (path, storage)
}
