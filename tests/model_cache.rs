mod common;

use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::time::Duration;

use common::{BASE_URL, MemoryFetcher, files_in, zip_archive};
use photobridge::inference::onnx::validate_native_path;
use photobridge::models::{
    ArchiveFetcher, CacheError, CacheState, FetchError, HttpFetcher, ModelCache, ModelRegistry, ProgressHub,
};

fn modnet(registry: &ModelRegistry) -> &photobridge::models::ModelDescriptor {
    registry.get("modnet").unwrap()
}

#[test]
fn first_use_downloads_and_installs() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let fetcher = Arc::new(MemoryFetcher::with_builtin_models());
    let hub = ProgressHub::new();
    let events = hub.subscribe();
    let cache = ModelCache::new(dir.path(), None, fetcher.clone(), hub);

    let d = modnet(&registry);
    assert_eq!(cache.entry(d), CacheState::Absent);

    let path = cache.ensure_available(d).unwrap();
    assert_eq!(path, cache.install_path(d));
    assert_eq!(std::fs::read(&path).unwrap(), b"fake-onnx-bytes");
    assert_eq!(cache.entry(d), CacheState::Installed);

    // Only the installed artifact is left behind
    assert_eq!(files_in(dir.path()), vec![path.clone()]);
    assert!(std::fs::read_dir(dir.path()).unwrap().flatten().all(|e| e.path().is_file()));

    let statuses: Vec<_> = events.try_iter().collect();
    assert!(statuses.iter().any(|e| e.status == "Downloading"));
    assert!(statuses.iter().any(|e| e.status == "Extracting" && e.progress == 0.5));
    let last = statuses.last().unwrap();
    assert_eq!((last.status.as_str(), last.progress), ("Ready", 1.0));
    assert!(statuses.windows(2).all(|w| w[0].progress <= w[1].progress));

    // Second call is served from disk
    assert_eq!(cache.ensure_available(d).unwrap(), path);
    assert_eq!(fetcher.fetch_count(), 1);
}

#[test]
fn concurrent_callers_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let fetcher = Arc::new(MemoryFetcher::with_builtin_models().slow(Duration::from_millis(150)));
    let cache = Arc::new(ModelCache::new(dir.path(), None, fetcher.clone(), ProgressHub::new()));
    let d = modnet(&registry).clone();

    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let d = d.clone();
            std::thread::spawn(move || {
                barrier.wait();
                cache.ensure_available(&d)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let expected = cache.install_path(&d);
    assert!(results.iter().all(|r| r.as_ref() == Ok(&expected)));
    assert_eq!(fetcher.fetch_count(), 1);
}

#[test]
fn archive_without_artifact_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let d = modnet(&registry);
    let fetcher = MemoryFetcher::default();
    fetcher.serve(&d.source_url, zip_archive(&[("readme.txt", b"nothing here")]));
    let cache = ModelCache::new(dir.path(), None, Arc::new(fetcher), ProgressHub::new());

    let err = cache.ensure_available(d).unwrap_err();
    assert!(matches!(err, CacheError::Extract { .. }), "{:?}", err);
    assert!(!cache.install_path(d).exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(cache.entry(d), CacheState::Absent);
}

#[test]
fn failed_download_reports_and_can_retry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let d = modnet(&registry);
    let fetcher = Arc::new(MemoryFetcher::default());
    let hub = ProgressHub::new();
    let events = hub.subscribe();
    let cache = ModelCache::new(dir.path(), None, fetcher.clone(), hub);

    let err = cache.ensure_available(d).unwrap_err();
    assert!(matches!(err, CacheError::Download { .. }), "{:?}", err);
    let last = events.try_iter().last().unwrap();
    assert_eq!(last.status, "Failed");

    // Nothing is remembered about the failure
    fetcher.serve(&d.source_url, zip_archive(&[(d.artifact.as_str(), b"weights")]));
    assert!(cache.ensure_available(d).is_ok());
    assert_eq!(fetcher.fetch_count(), 2);
}

#[test]
fn bundled_copy_avoids_download() {
    let models = tempfile::tempdir().unwrap();
    let bundled = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let d = modnet(&registry);
    let shipped = bundled.path().join(&d.artifact);
    std::fs::create_dir_all(shipped.parent().unwrap()).unwrap();
    std::fs::write(&shipped, b"bundled").unwrap();

    let fetcher = Arc::new(MemoryFetcher::default());
    let cache = ModelCache::new(models.path(), Some(bundled.path().to_path_buf()), fetcher.clone(), ProgressHub::new());

    assert_eq!(cache.ensure_available(d).unwrap(), shipped);
    assert_eq!(fetcher.fetch_count(), 0);
}

#[test]
fn empty_install_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let d = modnet(&registry);
    let fetcher = Arc::new(MemoryFetcher::with_builtin_models());
    let cache = ModelCache::new(dir.path(), None, fetcher.clone(), ProgressHub::new());
    std::fs::write(cache.install_path(d), b"").unwrap();

    let path = cache.ensure_available(d).unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"fake-onnx-bytes");
    assert_eq!(fetcher.fetch_count(), 1);
}

#[test]
fn unconfigured_base_url_is_a_download_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin("");
    let cache = ModelCache::new(dir.path(), None, Arc::new(HttpFetcher::new().unwrap()), ProgressHub::new());

    let err = cache.ensure_available(modnet(&registry)).unwrap_err();
    assert!(matches!(err, CacheError::Download { .. }), "{:?}", err);
}

/// Panics on its first fetch, then serves the built-in archives.
struct CrashOnceFetcher {
    crashed: AtomicBool,
    inner: MemoryFetcher,
}

impl ArchiveFetcher for CrashOnceFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, FetchError> {
        if !self.crashed.swap(true, Ordering::SeqCst) {
            panic!("fetcher blew up mid-download");
        }
        self.inner.fetch(url, dest, on_progress)
    }
}

#[test]
fn panicking_download_releases_the_model_for_retry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::builtin(BASE_URL);
    let d = modnet(&registry).clone();
    let fetcher = Arc::new(CrashOnceFetcher {
        crashed: AtomicBool::new(false),
        inner: MemoryFetcher::with_builtin_models(),
    });
    let hub = ProgressHub::new();
    let events = hub.subscribe();
    let cache = Arc::new(ModelCache::new(dir.path(), None, fetcher, hub));

    let first = std::panic::catch_unwind(AssertUnwindSafe(|| cache.ensure_available(&d)));
    assert!(first.is_err());
    assert_eq!(cache.entry(&d), CacheState::Absent);
    assert_eq!(events.try_iter().last().unwrap().status, "Failed");
    assert!(files_in(dir.path()).is_empty());

    let (tx, rx) = mpsc::channel();
    let retry_cache = cache.clone();
    let retry_d = d.clone();
    std::thread::spawn(move || {
        let _ = tx.send(retry_cache.ensure_available(&retry_d));
    });
    let retried = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("retry blocked behind the crashed download");
    assert_eq!(retried, Ok(cache.install_path(&d)));
}

#[test]
fn relative_models_dir_yields_loadable_paths() {
    let scratch = tempfile::Builder::new().prefix("relative-models-").tempdir_in(".").unwrap();
    let relative = std::path::Path::new(".").join(scratch.path().file_name().unwrap());
    assert!(relative.is_relative());

    let registry = ModelRegistry::builtin(BASE_URL);
    let d = modnet(&registry);
    let cache = ModelCache::new(&relative, None, Arc::new(MemoryFetcher::with_builtin_models()), ProgressHub::new());
    assert!(cache.models_dir().is_absolute());

    let path = cache.ensure_available(d).unwrap();
    assert!(path.is_absolute());
    assert!(path.is_file());
    assert_eq!(validate_native_path(&path, &["onnx", "ort"]), Ok(()));
}
