use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use super::{Acceleration, ExecutionProvider, InferenceRuntime, LoadedModel, RuntimeError};
use crate::models::{CacheError, ModelCache, ModelDescriptor};
use crate::tensor::{ImageTensor, element_count};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("model '{name}' is unavailable: {source}")]
    ModelUnavailable {
        name: String,
        #[source]
        source: CacheError,
    },
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("could not load model '{name}': {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: RuntimeError,
    },
    #[error("inference with '{name}' failed: {source}")]
    Inference {
        name: String,
        #[source]
        source: RuntimeError,
    },
    #[error("model '{0}' is not loaded")]
    NotLoaded(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Try the accelerated provider before falling back to CPU.
    pub prefer_acceleration: bool,
    pub intra_op_threads: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefer_acceleration: true,
            intra_op_threads: 4,
        }
    }
}

/// A loaded model registered under a name. Shared via `Arc`, so a session
/// stays usable by in-progress callers after it has been unloaded.
pub struct Session {
    name: String,
    path: PathBuf,
    model: Box<dyn LoadedModel>,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn provider(&self) -> ExecutionProvider {
        self.model.provider()
    }

    /// Run one forward pass. The buffer length is checked against the shape
    /// before the runtime sees it.
    pub fn run(&self, input: &ImageTensor) -> Result<ImageTensor, SessionError> {
        let expected = element_count(&input.shape);
        if input.data.len() != expected {
            return Err(SessionError::Inference {
                name: self.name.clone(),
                source: RuntimeError::ShapeMismatch {
                    shape: input.shape.clone(),
                    expected,
                    actual: input.data.len(),
                },
            });
        }
        self.model.run(input).map_err(|source| SessionError::Inference {
            name: self.name.clone(),
            source,
        })
    }
}

/// Owns every live model session, loading each at most once.
pub struct SessionManager {
    runtime: Arc<dyn InferenceRuntime>,
    cache: Arc<ModelCache>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn InferenceRuntime>, cache: Arc<ModelCache>, config: SessionConfig) -> Self {
        Self {
            runtime,
            cache,
            config,
            sessions: Mutex::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Per-name lock serialising load/unload of one model without blocking
    /// work on other models.
    fn slot(&self, name: &str) -> Arc<Mutex<()>> {
        self.load_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.lock_sessions().get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.lock_sessions().contains_key(name)
    }

    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// Return the session for `descriptor`, fetching the model and loading it
    /// on first use.
    pub fn get_or_load(&self, descriptor: &ModelDescriptor) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.get(&descriptor.name) {
            return Ok(session);
        }
        let slot = self.slot(&descriptor.name);
        let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = self.get(&descriptor.name) {
            return Ok(session);
        }

        let path = self
            .cache
            .ensure_available(descriptor)
            .map_err(|source| SessionError::ModelUnavailable {
                name: descriptor.name.clone(),
                source,
            })?;
        let session = self.open(&descriptor.name, &path)?;
        self.lock_sessions()
            .insert(descriptor.name.clone(), session.clone());
        Ok(session)
    }

    /// Load an explicit model file under `name`, replacing any session
    /// already registered with that name.
    pub fn load_from_path(&self, name: &str, path: &Path) -> Result<Arc<Session>, SessionError> {
        if !path.is_file() {
            return Err(SessionError::ModelNotFound(path.to_path_buf()));
        }
        let slot = self.slot(name);
        let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let session = self.open(name, path)?;
        if self
            .lock_sessions()
            .insert(name.to_string(), session.clone())
            .is_some()
        {
            info!("Replaced loaded model '{}'", name);
        }
        Ok(session)
    }

    /// Drop the registry's reference to `name`. Callers still holding the
    /// session finish their work; resources go when the last `Arc` does.
    pub fn unload(&self, name: &str) -> bool {
        let slot = self.slot(name);
        let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let removed = self.lock_sessions().remove(name).is_some();
        if removed {
            info!("Unloaded model '{}'", name);
        }
        removed
    }

    /// Unload every session; returns how many were registered.
    pub fn unload_all(&self) -> usize {
        let names = self.loaded_models();
        names.iter().filter(|n| self.unload(n)).count()
    }

    fn open(&self, name: &str, path: &Path) -> Result<Arc<Session>, SessionError> {
        let threads = self.config.intra_op_threads.max(1);
        let loaded = if self.config.prefer_acceleration {
            match self.runtime.load(path, Acceleration::Preferred, threads) {
                Err(RuntimeError::AccelerationUnavailable(reason)) => {
                    warn!("Acceleration unavailable for '{}' ({}), using CPU", name, reason);
                    self.runtime.load(path, Acceleration::CpuOnly, threads)
                }
                other => other,
            }
        } else {
            self.runtime.load(path, Acceleration::CpuOnly, threads)
        };
        let model = loaded.map_err(|source| SessionError::ModelLoad {
            name: name.to_string(),
            source,
        })?;
        info!(
            "Loaded model '{}' from {} on {} via {}",
            name,
            path.display(),
            model.provider().as_str(),
            self.runtime.name()
        );
        Ok(Arc::new(Session {
            name: name.to_string(),
            path: path.to_path_buf(),
            model,
        }))
    }
}
