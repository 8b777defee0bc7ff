#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgba, RgbaImage};
use photobridge::channel::{Bridge, BridgeConfig};
use photobridge::inference::{Acceleration, ExecutionProvider, InferenceRuntime, LoadedModel, RuntimeError};
use photobridge::models::{ArchiveFetcher, FetchError, ModelRegistry};
use photobridge::tensor::{ImageTensor, TensorLayout};

pub const BASE_URL: &str = "http://models.test";

// ============================================================================
// Fake runtime
// ============================================================================

/// What a fake model does, picked from the model file name.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Behaviour {
    /// 1-channel mask: 0 on the left half, 1 on the right half.
    SplitMask,
    /// Nearest-neighbour ×2 of the RGB input.
    Double,
    /// Solid black RGB at the input size.
    Black,
    /// First three input channels unchanged.
    Identity,
}

fn behaviour_for(path: &Path) -> Behaviour {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    if name.contains("modnet") {
        Behaviour::SplitMask
    } else if name.contains("realesrgan") {
        Behaviour::Double
    } else if name.contains("lama") {
        Behaviour::Black
    } else {
        Behaviour::Identity
    }
}

struct FakeModel {
    behaviour: Behaviour,
    provider: ExecutionProvider,
}

impl LoadedModel for FakeModel {
    fn run(&self, input: &ImageTensor) -> Result<ImageTensor, RuntimeError> {
        if input.layout != TensorLayout::Nchw || input.shape.len() != 4 {
            return Err(RuntimeError::Run(format!("unexpected input shape {:?}", input.shape)));
        }
        let (c, h, w) = (input.shape[1], input.shape[2], input.shape[3]);
        let plane = h * w;
        let at = |ch: usize, y: usize, x: usize| input.data[ch * plane + y * w + x];

        let (data, shape) = match self.behaviour {
            Behaviour::SplitMask => {
                let mut data = Vec::with_capacity(plane);
                for _y in 0..h {
                    for x in 0..w {
                        data.push(if x < w / 2 { 0.0 } else { 1.0 });
                    }
                }
                (data, vec![1, 1, h, w])
            }
            Behaviour::Double => {
                let (oh, ow) = (h * 2, w * 2);
                let mut data = Vec::with_capacity(3 * oh * ow);
                for ch in 0..3 {
                    for y in 0..oh {
                        for x in 0..ow {
                            data.push(at(ch.min(c - 1), y / 2, x / 2));
                        }
                    }
                }
                (data, vec![1, 3, oh, ow])
            }
            Behaviour::Black => (vec![0.0; 3 * plane], vec![1, 3, h, w]),
            Behaviour::Identity => (input.data[..3.min(c) * plane].to_vec(), vec![1, 3.min(c), h, w]),
        };
        ImageTensor::new(data, shape, TensorLayout::Nchw).map_err(|e| RuntimeError::Run(e.to_string()))
    }

    fn provider(&self) -> ExecutionProvider {
        self.provider
    }
}

/// Runtime double that counts loads and can refuse acceleration.
#[derive(Default)]
pub struct FakeRuntime {
    pub loads: AtomicUsize,
    pub accelerated_attempts: AtomicUsize,
    pub fail_acceleration: bool,
    pub load_delay: Duration,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_gpu() -> Arc<Self> {
        Arc::new(Self {
            fail_acceleration: true,
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            load_delay: delay,
            ..Self::default()
        })
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl InferenceRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn load(
        &self,
        path: &Path,
        acceleration: Acceleration,
        _intra_op_threads: usize,
    ) -> Result<Box<dyn LoadedModel>, RuntimeError> {
        if acceleration == Acceleration::Preferred {
            self.accelerated_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_acceleration {
                return Err(RuntimeError::AccelerationUnavailable("no device".to_string()));
            }
        }
        if !path.is_file() {
            return Err(RuntimeError::Load(format!("{} missing", path.display())));
        }
        std::thread::sleep(self.load_delay);
        self.loads.fetch_add(1, Ordering::SeqCst);
        let provider = match acceleration {
            Acceleration::Preferred => ExecutionProvider::Gpu,
            Acceleration::CpuOnly => ExecutionProvider::Cpu,
        };
        Ok(Box::new(FakeModel {
            behaviour: behaviour_for(path),
            provider,
        }))
    }
}

// ============================================================================
// In-memory archive server
// ============================================================================

/// Serves zip archives from memory keyed by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct MemoryFetcher {
    archives: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: AtomicUsize,
    pub delay: Duration,
}

impl MemoryFetcher {
    /// A fetcher holding a valid archive for every built-in model.
    pub fn with_builtin_models() -> Self {
        let fetcher = Self::default();
        let registry = ModelRegistry::builtin(BASE_URL);
        for name in registry.names() {
            if let Some(d) = registry.get(name) {
                fetcher.serve(&d.source_url, zip_archive(&[(d.artifact.as_str(), b"fake-onnx-bytes")]));
            }
        }
        fetcher
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.archives.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ArchiveFetcher for MemoryFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let bytes = self
            .archives
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })?;
        let total = bytes.len() as u64;
        let half = bytes.len() / 2;
        dest.write_all(&bytes[..half])?;
        on_progress(half as u64, Some(total));
        dest.write_all(&bytes[half..])?;
        on_progress(total, Some(total));
        Ok(total)
    }
}

/// Build a stored (uncompressed) zip archive in memory.
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

// ============================================================================
// Fixtures
// ============================================================================

/// Write a `w`×`h` opaque gradient PNG and return its path.
pub fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
    let img = RgbaImage::from_fn(w, h, |x, y| {
        Rgba([(x * 255 / w.max(1)) as u8, (y * 255 / h.max(1)) as u8, 128, 255])
    });
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

pub fn bridge_with(root: &Path, runtime: Arc<FakeRuntime>, fetcher: Arc<MemoryFetcher>) -> Bridge {
    Bridge::with_parts(
        ModelRegistry::builtin(BASE_URL),
        runtime,
        fetcher,
        BridgeConfig::rooted_at(root),
    )
}

/// Regular files in `dir` (empty if it doesn't exist).
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).filter(|p| p.is_file()).collect())
        .unwrap_or_default()
}
