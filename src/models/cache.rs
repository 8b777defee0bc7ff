use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::descriptor::ModelDescriptor;
use super::fetch::ArchiveFetcher;
use super::progress::ProgressHub;
use crate::settings::absolute_path;

/// Cache failures carry rendered messages so one outcome can be handed to
/// every caller waiting on the same download.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("download of '{model}' failed: {message}")]
    Download { model: String, message: String },
    #[error("archive for '{model}' is unusable: {message}")]
    Extract { model: String, message: String },
    #[error("model store i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e.to_string())
    }
}

/// Where a model currently stands in the local store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CacheState {
    Absent,
    Downloading(f32),
    Installed,
}

struct InFlight {
    outcome: Mutex<Option<Result<PathBuf, CacheError>>>,
    done: Condvar,
    progress: Mutex<f32>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
            progress: Mutex::new(0.0),
        }
    }

    fn finish(&self, outcome: Result<PathBuf, CacheError>) {
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
        self.done.notify_all();
    }

    /// Like `finish`, but leaves an outcome that is already set alone.
    /// Returns whether this call set it.
    fn finish_if_unset(&self, outcome: Result<PathBuf, CacheError>) -> bool {
        let mut guard = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(outcome);
        drop(guard);
        self.done.notify_all();
        true
    }

    fn wait(&self) -> Result<PathBuf, CacheError> {
        let mut guard = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = self.done.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn set_progress(&self, p: f32) {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = p;
    }

    fn progress(&self) -> f32 {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes temporary download/extract paths when the install finishes,
/// whichever way it finishes.
struct ScratchGuard {
    paths: Vec<PathBuf>,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        for p in &self.paths {
            let res = if p.is_dir() {
                fs::remove_dir_all(p)
            } else if p.exists() {
                fs::remove_file(p)
            } else {
                Ok(())
            };
            if let Err(e) = res {
                warn!("Could not remove scratch path {}: {}", p.display(), e);
            }
        }
    }
}

/// Held by the caller that owns an in-flight download. If the leader unwinds
/// before publishing an outcome, waiters are released with an error and the
/// model can be retried.
struct LeaderGuard<'a> {
    cache: &'a ModelCache,
    name: &'a str,
    flight: Arc<InFlight>,
}

impl LeaderGuard<'_> {
    fn complete(self, outcome: Result<PathBuf, CacheError>) {
        self.cache.lock_in_flight().remove(self.name);
        self.flight.finish(outcome);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.cache.lock_in_flight().remove(self.name);
        let aborted = self
            .flight
            .finish_if_unset(Err(CacheError::Io("download aborted".to_string())));
        if aborted {
            warn!("Download of '{}' aborted", self.name);
            self.cache.progress.publish(self.name, 0.0, "Failed");
        }
    }
}

/// Local store of compiled models, fetching and installing on demand.
pub struct ModelCache {
    models_dir: PathBuf,
    bundled_dir: Option<PathBuf>,
    fetcher: Arc<dyn ArchiveFetcher>,
    progress: ProgressHub,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
}

impl ModelCache {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        bundled_dir: Option<PathBuf>,
        fetcher: Arc<dyn ArchiveFetcher>,
        progress: ProgressHub,
    ) -> Self {
        Self {
            models_dir: absolute_path(models_dir),
            bundled_dir: bundled_dir.map(absolute_path),
            fetcher,
            progress,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    /// Path the installed artifact for `descriptor` lives at.
    pub fn install_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(descriptor.canonical_file_name())
    }

    /// Locate a usable local copy: the downloaded one first, then a bundled
    /// copy shipped alongside the binary. Zero-length files don't count.
    pub fn resolve_local_path(&self, descriptor: &ModelDescriptor) -> Option<PathBuf> {
        let downloaded = self.install_path(descriptor);
        if is_usable_artifact(&downloaded) {
            return Some(downloaded);
        }
        let bundled_dir = self.bundled_dir.as_ref()?;
        [
            bundled_dir.join(descriptor.canonical_file_name()),
            bundled_dir.join(&descriptor.artifact),
        ]
        .into_iter()
        .find(|p| is_usable_artifact(p))
    }

    pub fn entry(&self, descriptor: &ModelDescriptor) -> CacheState {
        if let Some(flight) = self.lock_in_flight().get(&descriptor.name) {
            return CacheState::Downloading(flight.progress());
        }
        if self.resolve_local_path(descriptor).is_some() {
            CacheState::Installed
        } else {
            CacheState::Absent
        }
    }

    /// Return a local path for the model, downloading and installing it if
    /// needed. Concurrent callers for the same model share one download.
    pub fn ensure_available(&self, descriptor: &ModelDescriptor) -> Result<PathBuf, CacheError> {
        if let Some(path) = self.resolve_local_path(descriptor) {
            self.progress.publish(&descriptor.name, 1.0, "Ready");
            return Ok(path);
        }

        let (flight, leader) = {
            let mut map = self.lock_in_flight();
            match map.get(&descriptor.name) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let f = Arc::new(InFlight::new());
                    map.insert(descriptor.name.clone(), f.clone());
                    (f, true)
                }
            }
        };

        if !leader {
            debug!("Waiting on in-flight download of '{}'", descriptor.name);
            return flight.wait();
        }
        let guard = LeaderGuard {
            cache: self,
            name: &descriptor.name,
            flight: flight.clone(),
        };

        // Someone may have finished installing between our check and
        // becoming leader.
        let outcome = match self.resolve_local_path(descriptor) {
            Some(path) => Ok(path),
            None => self.install(descriptor, &flight),
        };
        match &outcome {
            Ok(path) => {
                info!("Model '{}' available at {}", descriptor.name, path.display());
                self.progress.publish(&descriptor.name, 1.0, "Ready");
            }
            Err(e) => {
                warn!("Model '{}' install failed: {}", descriptor.name, e);
                self.progress.publish(&descriptor.name, 0.0, "Failed");
            }
        }
        guard.complete(outcome.clone());
        outcome
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<InFlight>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install(&self, descriptor: &ModelDescriptor, flight: &InFlight) -> Result<PathBuf, CacheError> {
        let name = descriptor.name.as_str();
        fs::create_dir_all(&self.models_dir)?;

        let tag = uuid::Uuid::new_v4().simple().to_string();
        let part_path = self.models_dir.join(format!(".{}-{}.part", name, tag));
        let zip_path = self.models_dir.join(format!(".{}-{}.zip", name, tag));
        let extract_dir = self.models_dir.join(format!(".{}-{}.extract", name, tag));
        let _scratch = ScratchGuard {
            paths: vec![part_path.clone(), zip_path.clone(), extract_dir.clone()],
        };

        // -- download --
        info!("Downloading model '{}' from {}", name, descriptor.source_url);
        self.progress.publish(name, 0.0, "Downloading");
        {
            let file = File::create(&part_path)?;
            let mut writer = BufWriter::new(file);
            let mut on_progress = |done: u64, total: Option<u64>| {
                if let Some(total) = total.filter(|t| *t > 0) {
                    let p = (done as f32 / total as f32).min(1.0) * 0.5;
                    flight.set_progress(p);
                    self.progress.publish(name, p, "Downloading");
                }
            };
            self.fetcher
                .fetch(&descriptor.source_url, &mut writer, &mut on_progress)
                .map_err(|e| CacheError::Download {
                    model: name.to_string(),
                    message: e.to_string(),
                })?;
        }
        fs::rename(&part_path, &zip_path)?;

        // -- extract --
        flight.set_progress(0.5);
        self.progress.publish(name, 0.5, "Extracting");
        let extract_err = |message: String| CacheError::Extract {
            model: name.to_string(),
            message,
        };
        let file = File::open(&zip_path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| extract_err(e.to_string()))?;
        fs::create_dir_all(&extract_dir)?;
        archive
            .extract(&extract_dir)
            .map_err(|e| extract_err(e.to_string()))?;

        let artifact = locate_artifact(&extract_dir, &descriptor.artifact)
            .ok_or_else(|| extract_err(format!("archive does not contain {}", descriptor.artifact)))?;
        if !is_usable_artifact(&artifact) {
            return Err(extract_err(format!("{} is empty", descriptor.artifact)));
        }

        // -- install --
        let dest = self.install_path(descriptor);
        if dest.is_dir() {
            fs::remove_dir_all(&dest)?;
        } else if dest.exists() {
            fs::remove_file(&dest)?;
        }
        fs::rename(&artifact, &dest)?;
        Ok(dest)
    }
}

fn is_usable_artifact(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Find the artifact inside an extracted archive: exact sub-path first, then
/// any file with the same name anywhere in the tree.
fn locate_artifact(root: &Path, artifact: &str) -> Option<PathBuf> {
    let exact = root.join(artifact);
    if exact.is_file() {
        return Some(exact);
    }
    let file_name = Path::new(artifact).file_name()?;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name() == Some(file_name) {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_artifact_falls_back_to_name_search() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("bundle").join("v2");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("model.onnx"), b"x").unwrap();

        let found = locate_artifact(dir.path(), "other/model.onnx").unwrap();
        assert_eq!(found, nested.join("model.onnx"));
        assert!(locate_artifact(dir.path(), "missing.onnx").is_none());
    }

    #[test]
    fn empty_files_are_not_usable() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("m.onnx");
        fs::write(&p, b"").unwrap();
        assert!(!is_usable_artifact(&p));
        fs::write(&p, b"1").unwrap();
        assert!(is_usable_artifact(&p));
    }
}
