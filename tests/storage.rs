mod common;

use common::{create, test_dir};
use datatanker::{Error, Options, Storage};

#[test]
fn smoke() {
    let (_path, storage) = create("smoke");
    assert!(storage.is_open());
    assert_eq!(storage.page_size().unwrap(), 4096);
}

#[test]
fn put_close_open_get() -> anyhow::Result<()> {
    let path = test_dir("put_close_open_get");
    {
        let storage = Storage::create_new(&path, Options::new())?;
        storage.put(b"a", b"1")?;
        storage.put(b"b", b"2")?;
        storage.close()?;
    }
    let storage = Storage::open_existing(&path, Options::new())?;
    assert_eq!(storage.get(b"a")?, Some(b"1".to_vec()));
    assert_eq!(storage.get(b"b")?, Some(b"2".to_vec()));
    assert_eq!(storage.count()?, 2);
    Ok(())
}

#[test]
fn random_inserts_scan_in_ascending_order() {
    let (_path, storage) = create("ordered_scan");

    // "000".."999" in a scrambled deterministic order.
    let mut keys: Vec<String> = (0..1000).map(|i| format!("{i:03}")).collect();
    let mut state = 0x2545F4914F6CDD1Du64;
    for i in (1..keys.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        keys.swap(i, (state % (i as u64 + 1)) as usize);
    }
    for k in &keys {
        storage.put(k.as_bytes(), k.as_bytes()).unwrap();
    }

    let all = storage.scan_range(b"", None).unwrap();
    assert_eq!(all.len(), 1000);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k, format!("{i:03}").as_bytes());
        assert_eq!(v, k);
    }

    assert_eq!(storage.first_key().unwrap(), Some(b"000".to_vec()));
    assert_eq!(storage.last_key().unwrap(), Some(b"999".to_vec()));
    assert_eq!(storage.next_key(b"499").unwrap(), Some(b"500".to_vec()));
    assert_eq!(storage.previous_key(b"500").unwrap(), Some(b"499".to_vec()));
    assert_eq!(storage.next_key(b"999").unwrap(), None);
    assert_eq!(storage.previous_key(b"000").unwrap(), None);

    let slice = storage.scan_range(b"100", Some(b"110")).unwrap();
    assert_eq!(slice.len(), 10);
    assert_eq!(slice[0].0, b"100");
    assert_eq!(slice[9].0, b"109");
}

#[test]
fn megabyte_value_round_trips_through_multi_pages() {
    let (_path, storage) = create("big_value");
    let payload: Vec<u8> = (0..1 << 20).map(|i| (i % 249) as u8).collect();

    let before = storage.page_count().unwrap();
    storage.put(b"big", &payload).unwrap();
    let after = storage.page_count().unwrap();

    // The blob occupies ceil(1 MiB / (page size - multi-page header)) pages.
    let fragment = 4096 - 40;
    let chain = ((payload.len() + fragment - 1) / fragment) as i64;
    assert_eq!(after - before, chain);

    assert_eq!(storage.get(b"big").unwrap(), Some(payload.clone()));

    // Removal hands the chain back: re-inserting needs no new pages.
    assert!(storage.remove(b"big").unwrap());
    storage.put(b"big", &payload).unwrap();
    assert!(storage.page_count().unwrap() <= after);

    storage.flush().unwrap();
    assert_eq!(storage.get(b"big").unwrap(), Some(payload));
}

#[test]
fn unsupported_structure_version_leaves_the_file_alone() {
    let path = test_dir("version_mismatch");
    {
        let storage = Storage::create_new(&path, Options::new()).unwrap();
        storage.put(b"k", b"v").unwrap();
        storage.close().unwrap();
    }

    // Stamp OnDiskStructureVersion = 99 into the heading page.
    let file = path.join("storage.dat");
    let mut bytes = std::fs::read(&file).unwrap();
    bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
    std::fs::write(&file, &bytes).unwrap();

    let before = std::fs::read(&file).unwrap();
    let result = Storage::open_existing(&path, Options::new());
    assert!(matches!(result, Err(Error::NotSupported(_))));
    assert_eq!(std::fs::read(&file).unwrap(), before);
}

#[test]
fn second_open_fails_while_locked() {
    let path = test_dir("exclusive_lock");
    let storage = Storage::create_new(&path, Options::new()).unwrap();

    let second = Storage::open_existing(&path, Options::new());
    assert!(matches!(second, Err(Error::Io(_))));

    // The lock is released on close.
    storage.close().unwrap();
    let reopened = Storage::open_existing(&path, Options::new()).unwrap();
    assert_eq!(reopened.count().unwrap(), 0);
}

#[test]
fn create_on_existing_storage_is_a_duplicate() {
    let path = test_dir("duplicate_create");
    let storage = Storage::create_new(&path, Options::new()).unwrap();
    storage.close().unwrap();
    assert!(matches!(
        Storage::create_new(&path, Options::new()),
        Err(Error::DuplicateStorage(_))
    ));
    // open_or_create takes the open path instead.
    let storage = Storage::open_or_create(&path, Options::new()).unwrap();
    assert!(storage.is_open());
}

#[test]
fn remove_missing_key_mutates_nothing() {
    let (_path, storage) = create("remove_missing");
    storage.put(b"present", b"x").unwrap();
    let pages = storage.page_count().unwrap();
    assert!(!storage.remove(b"absent").unwrap());
    assert_eq!(storage.page_count().unwrap(), pages);
    assert_eq!(storage.count().unwrap(), 1);
}

#[test]
fn overwrite_returns_the_latest_value() {
    let (_path, storage) = create("overwrite");
    storage.put(b"k", b"first").unwrap();
    storage.put(b"k", b"second").unwrap();
    assert_eq!(storage.get(b"k").unwrap(), Some(b"second".to_vec()));
    assert_eq!(storage.count().unwrap(), 1);
}

#[test]
fn reopen_preserves_everything() -> anyhow::Result<()> {
    let path = test_dir("reopen_preserves");
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..500)
        .map(|i| {
            (
                format!("key{i:04}").into_bytes(),
                format!("value{i}").into_bytes(),
            )
        })
        .collect();
    {
        let storage = Storage::create_new(&path, Options::new())?;
        for (k, v) in &pairs {
            storage.put(k, v)?;
        }
        for i in (0..500).step_by(3) {
            assert!(storage.remove(&pairs[i].0)?);
        }
        storage.close()?;
    }

    let storage = Storage::open_existing(&path, Options::new())?;
    let expected: Vec<_> = pairs
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 0)
        .map(|(_, p)| p.clone())
        .collect();
    assert_eq!(storage.count()?, expected.len() as u64);
    for (k, v) in &expected {
        assert_eq!(storage.get(k)?.as_ref(), Some(v));
        assert!(storage.contains(k)?);
    }
    assert_eq!(storage.scan_range(b"", None)?, expected);
    Ok(())
}

#[test]
fn operations_after_close_are_rejected() {
    let (_path, storage) = create("closed_ops");
    storage.put(b"k", b"v").unwrap();
    storage.close().unwrap();
    assert!(!storage.is_open());
    assert!(matches!(storage.get(b"k"), Err(Error::NotOpen)));
    assert!(matches!(storage.put(b"k", b"v"), Err(Error::NotOpen)));
    assert!(matches!(storage.flush(), Err(Error::NotOpen)));
    // Closing again is harmless.
    storage.close().unwrap();
}

#[test]
fn page_size_is_fixed_at_creation() {
    let path = test_dir("page_size");
    {
        let mut options = Options::new();
        options.page_size(8192);
        let storage = Storage::create_new(&path, options).unwrap();
        assert_eq!(storage.page_size().unwrap(), 8192);
        storage.put(b"k", b"v").unwrap();
        storage.close().unwrap();
    }

    // Opening without a page size adopts the file's.
    let storage = Storage::open_existing(&path, Options::new()).unwrap();
    assert_eq!(storage.page_size().unwrap(), 8192);
    assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    storage.close().unwrap();

    // A conflicting page size is refused.
    let mut options = Options::new();
    options.page_size(4096);
    assert!(matches!(
        Storage::open_existing(&path, options),
        Err(Error::NotSupported(_))
    ));

    // So is an invalid one at creation.
    let mut options = Options::new();
    options.page_size(1000);
    assert!(matches!(
        Storage::create_new(test_dir("bad_page_size"), options),
        Err(Error::NotSupported(_))
    ));
}

#[test]
fn oversized_keys_are_rejected() {
    let (_path, storage) = create("key_limit");
    let key = vec![b'k'; 4096 / 8 + 1];
    assert!(matches!(
        storage.put(&key, b"v"),
        Err(Error::KeyTooLarge { .. })
    ));
    // The rejected insert wrote nothing.
    assert_eq!(storage.count().unwrap(), 0);
}

#[test]
fn foreign_info_file_is_not_supported() {
    let path = test_dir("foreign_info");
    {
        let storage = Storage::create_new(&path, Options::new()).unwrap();
        storage.close().unwrap();
    }
    std::fs::write(
        path.join("info"),
        "StorageClrTypeName=SomethingElse\nOnDiskStructureVersion=1\n",
    )
    .unwrap();
    assert!(matches!(
        Storage::open_existing(&path, Options::new()),
        Err(Error::NotSupported(_))
    ));

    // A missing sidecar is a format error instead.
    std::fs::remove_file(path.join("info")).unwrap();
    assert!(matches!(
        Storage::open_existing(&path, Options::new()),
        Err(Error::StorageFormat(_))
    ));
}

#[test]
fn deletion_churn_reuses_pages() {
    let (_path, storage) = create("churn");
    for i in 0..400 {
        storage
            .put(format!("key{i:04}").as_bytes(), &vec![b'v'; 64])
            .unwrap();
    }
    let peak = storage.page_count().unwrap();

    for round in 0..5 {
        for i in 0..400 {
            if (i + round) % 2 == 0 {
                storage.remove(format!("key{i:04}").as_bytes()).unwrap();
            }
        }
        for i in 0..400 {
            storage
                .put(format!("key{i:04}").as_bytes(), &vec![b'v'; 64])
                .unwrap();
        }
    }
    // Steady-state churn lives off recycled pages.
    assert!(storage.page_count().unwrap() <= peak + 4);
    assert_eq!(storage.count().unwrap(), 400);
}

#[test]
fn flush_then_crashless_reopen_sees_the_data() {
    let path = test_dir("flush_visibility");
    let storage = Storage::create_new(&path, Options::new()).unwrap();
    storage.put(b"durable", b"yes").unwrap();
    storage.flush().unwrap();

    // The backing file already holds the mutation after flush; close and
    // reopen to observe it through a fresh cache.
    storage.close().unwrap();
    let storage = Storage::open_existing(&path, Options::new()).unwrap();
    assert_eq!(storage.get(b"durable").unwrap(), Some(b"yes".to_vec()));
}
