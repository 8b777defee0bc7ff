mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{BASE_URL, FakeRuntime, MemoryFetcher};
use photobridge::inference::{ExecutionProvider, RuntimeError, SessionConfig, SessionError, SessionManager};
use photobridge::models::{ModelCache, ModelRegistry, ProgressHub};
use photobridge::tensor::{ImageTensor, TensorLayout};

fn manager(dir: &std::path::Path, runtime: Arc<FakeRuntime>) -> (SessionManager, Arc<MemoryFetcher>) {
    let fetcher = Arc::new(MemoryFetcher::with_builtin_models());
    let cache = Arc::new(ModelCache::new(dir, None, fetcher.clone(), ProgressHub::new()));
    (SessionManager::new(runtime, cache, SessionConfig::default()), fetcher)
}

fn rgb_tensor(side: usize) -> ImageTensor {
    ImageTensor::new(vec![0.5; 3 * side * side], vec![1, 3, side, side], TensorLayout::Nchw).unwrap()
}

#[test]
fn model_is_loaded_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let (sessions, fetcher) = manager(dir.path(), runtime.clone());
    let registry = ModelRegistry::builtin(BASE_URL);
    let d = registry.get("realesrgan_x2").unwrap();

    let a = sessions.get_or_load(d).unwrap();
    let b = sessions.get_or_load(d).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(runtime.load_count(), 1);
    assert_eq!(fetcher.fetch_count(), 1);
    assert_eq!(a.provider(), ExecutionProvider::Gpu);
    assert_eq!(sessions.loaded_models(), vec!["realesrgan_x2".to_string()]);
}

#[test]
fn concurrent_first_use_loads_once() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::slow(Duration::from_millis(100));
    let (sessions, _) = manager(dir.path(), runtime.clone());
    let sessions = Arc::new(sessions);
    let d = ModelRegistry::builtin(BASE_URL).get("modnet").unwrap().clone();

    let barrier = Arc::new(Barrier::new(5));
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let sessions = sessions.clone();
            let barrier = barrier.clone();
            let d = d.clone();
            std::thread::spawn(move || {
                barrier.wait();
                sessions.get_or_load(&d).map(|s| s.name().to_string())
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap().unwrap(), "modnet");
    }
    assert_eq!(runtime.load_count(), 1);
}

#[test]
fn missing_acceleration_falls_back_to_cpu() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::without_gpu();
    let (sessions, _) = manager(dir.path(), runtime.clone());
    let d = ModelRegistry::builtin(BASE_URL).get("modnet").unwrap().clone();

    let session = sessions.get_or_load(&d).unwrap();
    assert_eq!(session.provider(), ExecutionProvider::Cpu);
    assert_eq!(runtime.accelerated_attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn cpu_only_config_skips_acceleration() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let cache = Arc::new(ModelCache::new(
        dir.path(),
        None,
        Arc::new(MemoryFetcher::with_builtin_models()),
        ProgressHub::new(),
    ));
    let config = SessionConfig {
        prefer_acceleration: false,
        intra_op_threads: 1,
    };
    let sessions = SessionManager::new(runtime.clone(), cache, config);
    let d = ModelRegistry::builtin(BASE_URL).get("lama").unwrap().clone();

    assert_eq!(sessions.get_or_load(&d).unwrap().provider(), ExecutionProvider::Cpu);
    assert_eq!(runtime.accelerated_attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn unloaded_session_finishes_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, _) = manager(dir.path(), FakeRuntime::new());
    let d = ModelRegistry::builtin(BASE_URL).get("realesrgan_x2").unwrap().clone();

    let held = sessions.get_or_load(&d).unwrap();
    assert!(sessions.unload("realesrgan_x2"));
    assert!(!sessions.is_loaded("realesrgan_x2"));
    assert!(!sessions.unload("realesrgan_x2"));

    let out = held.run(&rgb_tensor(8)).unwrap();
    assert_eq!(out.shape, vec![1, 3, 16, 16]);
}

#[test]
fn explicit_load_registers_under_name() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, _) = manager(dir.path(), FakeRuntime::new());
    let model = dir.path().join("custom.onnx");
    std::fs::write(&model, b"weights").unwrap();

    let first = sessions.load_from_path("default", &model).unwrap();
    assert_eq!(first.path(), model.as_path());
    let second = sessions.load_from_path("default", &model).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(sessions.loaded_models(), vec!["default".to_string()]);

    let missing = dir.path().join("nope.onnx");
    assert!(matches!(
        sessions.load_from_path("other", &missing),
        Err(SessionError::ModelNotFound(p)) if p == missing
    ));
    assert_eq!(sessions.unload_all(), 1);
}

#[test]
fn mismatched_buffer_never_reaches_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let (sessions, _) = manager(dir.path(), FakeRuntime::new());
    let model = dir.path().join("custom.onnx");
    std::fs::write(&model, b"weights").unwrap();
    let session = sessions.load_from_path("default", &model).unwrap();

    let bad = ImageTensor {
        data: vec![0.0; 10],
        shape: vec![1, 3, 4, 4],
        layout: TensorLayout::Nchw,
    };
    match session.run(&bad) {
        Err(SessionError::Inference {
            source: RuntimeError::ShapeMismatch { expected, actual, .. },
            ..
        }) => {
            assert_eq!(expected, 48);
            assert_eq!(actual, 10);
        }
        other => panic!("unexpected: {:?}", other.map(|t| t.shape)),
    }
}

#[test]
fn unreachable_model_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ModelCache::new(
        dir.path(),
        None,
        Arc::new(MemoryFetcher::default()),
        ProgressHub::new(),
    ));
    let runtime = FakeRuntime::new();
    let sessions = SessionManager::new(runtime.clone(), cache, SessionConfig::default());
    let d = ModelRegistry::builtin(BASE_URL).get("modnet").unwrap().clone();

    assert!(matches!(
        sessions.get_or_load(&d),
        Err(SessionError::ModelUnavailable { .. })
    ));
    assert_eq!(runtime.load_count(), 0);
    assert!(!sessions.is_loaded("modnet"));
}
