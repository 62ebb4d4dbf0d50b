use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

// Process-wide advisory lock registry keyed by absolute file path.
// Read locks share, write locks are exclusive; a lock is held for the
// duration of the closure and released on scope exit. Entries are created
// on first use and kept for the life of the process.
static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<RwLock<()>> {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    registry
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(RwLock::new(())))
        .clone()
}

/// Run `f` while holding a shared read lock on `path`.
pub fn with_read<R>(path: &Path, f: impl FnOnce() -> R) -> R {
    let lock = lock_for(path);
    let _guard = lock.read().unwrap_or_else(|e| e.into_inner());
    f()
}

/// Run `f` while holding an exclusive write lock on `path`.
pub fn with_write<R>(path: &Path, f: impl FnOnce() -> R) -> R {
    let lock = lock_for(path);
    let _guard = lock.write().unwrap_or_else(|e| e.into_inner());
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_read_locks_share() {
        let path = PathBuf::from("/locks/shared");
        with_read(&path, || {
            // A second reader on the same path must not deadlock.
            with_read(&path, || {});
        });
    }

    #[test]
    fn test_write_lock_excludes_writers() {
        let path = PathBuf::from("/locks/exclusive");
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    with_write(&path, || {
                        let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        // No other writer may be inside the critical section.
                        assert_eq!(active, 1);
                        std::thread::sleep(Duration::from_millis(5));
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_distinct_paths_do_not_contend() {
        with_write(Path::new("/locks/a"), || {
            with_write(Path::new("/locks/b"), || {});
        });
    }
}
