//! File growth under resize policies: repeated truncations stay
//! page-aligned, custom policies are consulted, and the maximum offset is
//! honoured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use skipstore::{DbFlags, Error, FiboPolicy, MulPolicy, ResizePolicy, Store};
use tempfile::tempdir;

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps <= 0 {
        4096
    } else {
        ps as u64
    }
}

/// Wraps a policy and counts how often it is consulted.
struct CountingPolicy<P> {
    inner: P,
    calls: Arc<AtomicU64>,
}

impl<P: ResizePolicy> ResizePolicy for CountingPolicy<P> {
    fn compute(&mut self, requested: u64, current: u64, page_size: u64) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.compute(requested, current, page_size)
    }
}

#[test]
fn fibonacci_growth_stays_aligned_through_many_truncations() {
    let dir = tempdir().unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    let store = Store::builder()
        .path(dir.path().join("growth.skp"))
        .random_seed(3)
        .initial_size(0)
        .resize_policy(CountingPolicy {
            inner: FiboPolicy::default(),
            calls: calls.clone(),
        })
        .open()
        .unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();

    let psize = page_size();
    let val = vec![0x42u8; 64 * 1024];
    let mut sizes_seen = Vec::new();
    for i in 0..64u32 {
        let key = format!("grow{i:04}");
        db.put(key.as_bytes(), &val).unwrap();
        let size = store.file_size().unwrap();
        assert_eq!(size % psize, 0, "file size unaligned after put {i}");
        if sizes_seen.last() != Some(&size) {
            sizes_seen.push(size);
        }
    }

    // The policy was consulted and the file grew several times.
    assert!(calls.load(Ordering::Relaxed) >= 3);
    assert!(sizes_seen.len() >= 3, "expected at least 3 truncations");
    assert!(sizes_seen.windows(2).all(|w| w[0] < w[1]));

    // Everything written during growth is intact.
    for i in 0..64u32 {
        let key = format!("grow{i:04}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), val);
    }

    store.close().unwrap();
}

#[test]
fn multiplier_policy_overshoots_requests() {
    let dir = tempdir().unwrap();
    let store = Store::builder()
        .path(dir.path().join("mul.skp"))
        .random_seed(3)
        .resize_policy(MulPolicy::new(2, 1))
        .open()
        .unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();

    let before = store.file_size().unwrap();
    let val = vec![0u8; 1024 * 1024];
    db.put(b"big", &val).unwrap();
    let after = store.file_size().unwrap();

    assert!(after > before);
    assert_eq!(after % page_size(), 0);
    assert_eq!(db.get(b"big").unwrap(), val);

    store.close().unwrap();
}

#[test]
fn maxoff_caps_growth() {
    let dir = tempdir().unwrap();
    let psize = page_size();
    let store = Store::builder()
        .path(dir.path().join("capped.skp"))
        .random_seed(3)
        .maxoff(64 * psize)
        .open()
        .unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();

    // Fill until the cap bites.
    let val = vec![0u8; 8 * 1024];
    let mut hit_cap = false;
    for i in 0..256u32 {
        let key = format!("fill{i:04}");
        match db.put(key.as_bytes(), &val) {
            Ok(()) => {}
            Err(Error::MaxOffset) => {
                hit_cap = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(hit_cap, "growth never hit the offset cap");
    assert!(store.file_size().unwrap() <= 64 * psize);

    // The store keeps serving reads after refusing growth.
    assert_eq!(db.get(b"fill0000").unwrap(), val);

    store.close().unwrap();
}

#[test]
fn initial_size_preallocates() {
    let dir = tempdir().unwrap();
    let store = Store::builder()
        .path(dir.path().join("prealloc.skp"))
        .initial_size(1024 * 1024)
        .open()
        .unwrap();

    assert!(store.file_size().unwrap() >= 1024 * 1024);
    assert_eq!(store.file_size().unwrap() % page_size(), 0);

    store.close().unwrap();
}
