//! Tiered Store Integration Tests
//!
//! End-to-end scenarios through the public API:
//! - Expiry notifications
//! - Pinning under capacity pressure
//! - Persistence across restarts, stale and corrupt indexes
//! - Concurrent writers and readers

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use assert_matches::assert_matches;
use tierstore::{
    DiskConfig, Element, Error, PolicyKind, RecordingListener, RemovalCause, StoreConfig,
    TieredStore,
};

fn element(key: &str, value: &str) -> Element<String> {
    Element::new(key.to_string(), value.as_bytes().to_vec())
}

fn persistent(dir: &Path, name: &str, max_in_memory: usize) -> StoreConfig {
    StoreConfig::new(name, max_in_memory).with_disk(DiskConfig {
        persistent: true,
        ..DiskConfig::new(dir)
    })
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(20));
    }
}

// =============================================================================
// Expiry Notifications
// =============================================================================

mod expiry_tests {
    use super::*;

    #[test]
    fn test_expired_element_notified_once() {
        let store: TieredStore<String> = TieredStore::open(StoreConfig::new("ttl", 100)).unwrap();
        let listener = Arc::new(RecordingListener::new());
        store.register_listener(listener.clone());

        store.put(element("session", "abc").with_ttl(1)).unwrap();
        assert!(store.get(&"session".to_string()).unwrap().is_some());

        thread::sleep(Duration::from_millis(1100));
        let store = Arc::new(store);
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get(&"session".to_string()).unwrap())
            })
            .collect();
        for reader in readers {
            assert!(reader.join().unwrap().is_none());
        }

        assert_eq!(listener.count(&"session".to_string(), RemovalCause::Expired), 1);
        assert_eq!(listener.len(), 1);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_expiry_worker_sweeps_untouched_elements() {
        let config = StoreConfig {
            expiry_interval_secs: 1,
            ..StoreConfig::new("sweeper", 100)
        };
        let store: TieredStore<String> = TieredStore::open(config).unwrap();
        let listener = Arc::new(RecordingListener::new());
        store.register_listener(listener.clone());

        store.put(element("short", "1").with_ttl(1)).unwrap();
        store.put(element("forever", "2")).unwrap();

        wait_for("expiry sweep", || listener.len() == 1);
        assert_eq!(listener.events()[0], ("short".to_string(), RemovalCause::Expired));
        assert_eq!(store.size(), 1);
        assert!(store.contains_key(&"forever".to_string()));
    }

    #[test]
    fn test_explicit_remove_is_not_notified() {
        let store: TieredStore<String> = TieredStore::open(StoreConfig::new("quiet", 10)).unwrap();
        let listener = Arc::new(RecordingListener::new());
        store.register_listener(listener.clone());

        store.put(element("a", "1")).unwrap();
        store.remove(&"a".to_string()).unwrap();
        store.put(element("b", "1")).unwrap();
        store.remove_all().unwrap();
        assert!(listener.is_empty());
    }

    #[test]
    fn test_tti_extends_with_access() {
        let store: TieredStore<String> = TieredStore::open(StoreConfig::new("idle", 10)).unwrap();
        store.put(element("a", "1").with_tti(2)).unwrap();

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(800));
            assert!(store.get(&"a".to_string()).unwrap().is_some());
        }
        thread::sleep(Duration::from_millis(2200));
        assert!(store.get(&"a".to_string()).unwrap().is_none());
    }
}

// =============================================================================
// Pinning Under Capacity
// =============================================================================

mod pinning_tests {
    use super::*;

    #[test]
    fn test_pinned_elements_survive_memory_pressure() {
        let store: TieredStore<String> = TieredStore::open(StoreConfig::new("pins", 5)).unwrap();

        for i in 0..10 {
            store.put_pinned(element(&format!("pin{}", i), "p")).unwrap();
        }
        for i in 0..50 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }

        for i in 0..10 {
            let key = format!("pin{}", i);
            assert!(store.is_pinned(&key));
            assert!(store.get(&key).unwrap().is_some(), "{} was evicted", key);
        }
        assert_eq!(store.statistics().pinned, 10);
    }

    #[test]
    fn test_pinned_elements_are_not_spooled() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new("pins-disk", 4).with_disk(DiskConfig::new(dir.path()));
        let store: TieredStore<String> = TieredStore::open(config).unwrap();

        for i in 0..6 {
            store.put_pinned(element(&format!("pin{}", i), "p")).unwrap();
        }
        for i in 0..30 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }
        wait_for("spool queue", || store.spooling_size() == 0);

        let before = store.statistics();
        for i in 0..6 {
            store.get(&format!("pin{}", i)).unwrap().unwrap();
        }
        let after = store.statistics();
        assert_eq!(after.memory_hits - before.memory_hits, 6);
        assert_eq!(after.disk_hits, before.disk_hits);
        assert_eq!(store.size(), 36);
    }

    #[test]
    fn test_pins_filling_memory_push_rest_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new("pins-full", 10).with_disk(DiskConfig::new(dir.path()));
        let store: TieredStore<String> = TieredStore::open(config).unwrap();

        for i in 0..10 {
            store.put_pinned(element(&format!("pin{}", i), "p")).unwrap();
        }
        for i in 0..5 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }
        wait_for("spool queue", || store.spooling_size() == 0);

        assert_eq!(store.size(), 15);
        assert_eq!(store.in_memory_size(), 10);
        assert_eq!(store.on_disk_size(), 5);
        assert_eq!(store.statistics().pinned, 10);

        for i in 0..10 {
            let e = store.get(&format!("pin{}", i)).unwrap().unwrap();
            assert_eq!(e.value().as_ref(), b"p");
        }
        for i in 0..5 {
            let e = store.get(&format!("k{}", i)).unwrap().unwrap();
            assert_eq!(e.value().as_ref(), b"v");
        }
        assert_eq!(store.statistics().memory_hits, 10);
        assert_eq!(store.statistics().disk_hits, 5);
        assert_eq!(store.size(), 15);
    }

    #[test]
    fn test_pin_before_put_and_unpin_all() {
        let store: TieredStore<String> = TieredStore::open(StoreConfig::new("pre-pin", 3)).unwrap();

        store.set_pinned(&"later".to_string(), true).unwrap();
        assert!(store.is_pinned(&"later".to_string()));
        assert_eq!(store.size(), 0);

        store.put(element("later", "x")).unwrap();
        for i in 0..10 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }
        assert!(store.get(&"later".to_string()).unwrap().is_some());

        store.set_pinned(&"ghost".to_string(), true).unwrap();
        store.unpin_all().unwrap();
        assert!(!store.is_pinned(&"later".to_string()));
        assert!(!store.contains_key(&"ghost".to_string()));
        assert!(store.size() <= 3);
    }

    #[test]
    fn test_remove_all_keeps_pins() {
        let store: TieredStore<String> = TieredStore::open(StoreConfig::new("clear-pins", 10)).unwrap();
        store.put_pinned(element("a", "1")).unwrap();
        store.remove_all().unwrap();

        assert_eq!(store.size(), 0);
        assert!(store.is_pinned(&"a".to_string()));
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence_tests {
    use super::*;

    #[test]
    fn test_restart_restores_every_element() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: TieredStore<String> =
                TieredStore::open(persistent(dir.path(), "restart", 10)).unwrap();
            for i in 0..50 {
                store
                    .put(element(&format!("k{}", i), &format!("value-{}", i)))
                    .unwrap();
            }
            store.put_pinned(element("pinned", "kept")).unwrap();
            store.dispose().unwrap();
        }

        let index = DiskConfig::new(dir.path()).index_path("restart");
        assert!(index.exists());

        let store: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "restart", 10)).unwrap();
        assert!(!index.exists(), "index must be consumed on load");
        assert_eq!(store.size(), 51);
        assert_eq!(store.on_disk_size(), 51);
        for i in 0..50 {
            let e = store.get(&format!("k{}", i)).unwrap().unwrap();
            assert_eq!(e.value().as_ref(), format!("value-{}", i).as_bytes());
        }
        let pinned = store.get(&"pinned".to_string()).unwrap().unwrap();
        assert_eq!(pinned.value().as_ref(), b"kept");
    }

    #[test]
    fn test_flush_then_crash_restores_disk_elements() {
        let dir = tempfile::tempdir().unwrap();
        let store: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "flushed", 2)).unwrap();
        for i in 0..10 {
            store.put(element(&format!("k{}", i), "v")).unwrap();
        }
        wait_for("spool queue", || store.spooling_size() == 0);
        store.flush().unwrap();
        let on_disk = store.on_disk_size();
        assert_eq!(on_disk, 8);

        // simulate a crash: the index on disk is the flushed one
        let index = DiskConfig::new(dir.path()).index_path("flushed");
        let saved = std::fs::read(&index).unwrap();
        store.dispose().unwrap();
        std::fs::write(&index, saved).unwrap();

        let reopened: TieredStore<String> = TieredStore::open(StoreConfig {
            disk: Some(DiskConfig {
                persistent: true,
                index_staleness_tolerance_ms: 60_000,
                ..DiskConfig::new(dir.path())
            }),
            ..StoreConfig::new("flushed", 2)
        })
        .unwrap();
        assert!(reopened.size() >= on_disk);
    }

    #[test]
    fn test_non_persistent_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new("scratch", 2).with_disk(DiskConfig::new(dir.path()));
        {
            let store: TieredStore<String> = TieredStore::open(config.clone()).unwrap();
            for i in 0..10 {
                store.put(element(&format!("k{}", i), "v")).unwrap();
            }
            store.dispose().unwrap();
        }
        let disk = config.disk.clone().unwrap();
        assert!(!disk.data_path("scratch").exists());
        assert!(!disk.index_path("scratch").exists());

        let store: TieredStore<String> = TieredStore::open(config).unwrap();
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_second_open_of_same_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "exclusive", 10)).unwrap();
        let second = TieredStore::<String>::open(persistent(dir.path(), "exclusive", 10));
        assert_matches!(second, Err(Error::Config(_)));

        first.dispose().unwrap();
        let third = TieredStore::<String>::open(persistent(dir.path(), "exclusive", 10));
        assert!(third.is_ok());
    }

    #[test]
    fn test_disposed_store_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "closed", 10)).unwrap();
        store.dispose().unwrap();

        assert_matches!(store.put(element("a", "1")), Err(Error::Disposed(_)));
        assert_matches!(store.get(&"a".to_string()), Err(Error::Disposed(_)));
        assert_matches!(store.flush(), Err(Error::Disposed(_)));
    }
}

// =============================================================================
// Staleness
// =============================================================================

mod staleness_tests {
    use super::*;

    #[test]
    fn test_data_newer_than_index_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: TieredStore<String> =
                TieredStore::open(persistent(dir.path(), "stale", 10)).unwrap();
            for i in 0..5 {
                store.put(element(&format!("k{}", i), "v")).unwrap();
            }
            store.dispose().unwrap();
        }

        let data = DiskConfig::new(dir.path()).data_path("stale");
        let file = std::fs::OpenOptions::new().write(true).open(&data).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(30))
            .unwrap();
        drop(file);

        let store: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "stale", 10)).unwrap();
        assert_eq!(store.size(), 0);
        assert!(store.get(&"k0".to_string()).unwrap().is_none());

        store.put(element("fresh", "v")).unwrap();
        assert!(store.get(&"fresh".to_string()).unwrap().is_some());
    }
}

// =============================================================================
// Corrupt Index
// =============================================================================

mod corrupt_index_tests {
    use super::*;

    #[test]
    fn test_garbage_index_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: TieredStore<String> =
                TieredStore::open(persistent(dir.path(), "garbage", 10)).unwrap();
            for i in 0..5 {
                store.put(element(&format!("k{}", i), "v")).unwrap();
            }
            store.dispose().unwrap();
        }

        let disk = DiskConfig::new(dir.path());
        std::fs::write(disk.index_path("garbage"), b"not an index at all").unwrap();

        let store: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "garbage", 10)).unwrap();
        assert_eq!(store.size(), 0);
        assert_eq!(std::fs::metadata(disk.data_path("garbage")).unwrap().len(), 0);

        for i in 0..20 {
            store.put(element(&format!("n{}", i), "v")).unwrap();
        }
        assert_eq!(store.size(), 20);
    }

    #[test]
    fn test_truncated_index_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: TieredStore<String> =
                TieredStore::open(persistent(dir.path(), "truncated", 10)).unwrap();
            for i in 0..20 {
                store.put(element(&format!("k{}", i), "v")).unwrap();
            }
            store.dispose().unwrap();
        }

        let index = DiskConfig::new(dir.path()).index_path("truncated");
        let bytes = std::fs::read(&index).unwrap();
        std::fs::write(&index, &bytes[..bytes.len() / 2]).unwrap();

        let store: TieredStore<String> =
            TieredStore::open(persistent(dir.path(), "truncated", 10)).unwrap();
        assert_eq!(store.size(), 0);
    }
}

// =============================================================================
// Concurrent Writers
// =============================================================================

mod concurrency_tests {
    use super::*;

    fn hammer(config: StoreConfig) {
        let store: Arc<TieredStore<String>> = Arc::new(TieredStore::open(config).unwrap());
        let threads = 8;
        let per_thread = 300;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let key = format!("t{}-{}", t, i);
                        store.put(element(&key, &key)).unwrap();
                        if i % 3 == 0 {
                            let _ = store.get(&format!("t{}-{}", (t + 1) % threads, i)).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        wait_for("spool queue", || store.spooling_size() == 0);

        assert_eq!(store.size(), threads * per_thread);
        for t in 0..threads {
            for i in (0..per_thread).step_by(37) {
                let key = format!("t{}-{}", t, i);
                let e = store.get(&key).unwrap().unwrap();
                assert_eq!(e.value().as_ref(), key.as_bytes());
            }
        }
        store.dispose().unwrap();
    }

    #[test]
    fn test_concurrent_writers_with_disk_lru() {
        let dir = tempfile::tempdir().unwrap();
        hammer(StoreConfig::new("hammer-lru", 64).with_disk(DiskConfig::new(dir.path())));
    }

    #[test]
    fn test_concurrent_writers_with_disk_clock() {
        let dir = tempfile::tempdir().unwrap();
        hammer(
            StoreConfig::new("hammer-clock", 64)
                .with_policy(PolicyKind::Clock)
                .with_disk(DiskConfig::new(dir.path())),
        );
    }

    #[test]
    fn test_concurrent_updates_of_shared_keys() {
        let store: Arc<TieredStore<String>> =
            Arc::new(TieredStore::open(StoreConfig::new("shared", 1000)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..200 {
                        store
                            .put(element(&format!("k{}", i % 20), &t.to_string()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.size(), 20);
        let stats = store.statistics();
        assert_eq!(stats.puts, 800);
        assert_eq!(stats.updates, 780);
    }
}
