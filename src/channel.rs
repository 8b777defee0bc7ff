// ============================================================================
// METHOD CHANNEL: keyed-argument method calls in, {result | error} out
// ============================================================================
//
// `Bridge::call` validates arguments on the caller's thread, runs the work on
// a rayon worker and queues the response on a completion channel that the
// caller's designated thread drains (`drain_completions` / `wait_completion`).

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::inference::onnx::validate_native_path;
use crate::inference::{InferenceRuntime, OnnxRuntime, SessionConfig, SessionError, SessionManager};
use crate::models::descriptor::DEFAULT_MODEL;
use crate::models::{ArchiveFetcher, HttpFetcher, ModelCache, ModelRegistry, ProgressEvent, ProgressHub};
use crate::ops::{Adjustments, NamedFilter};
use crate::pipeline::{Operation, Orchestrator, OutputOptions, TransformError, TransformRequest, UpscaleFactor};
use crate::settings::{BridgeSettings, absolute_path};
use crate::tensor::MaskSettings;

/// Stable error codes returned across the channel.
pub mod codes {
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const INVALID_IMAGE: &str = "INVALID_IMAGE";
    pub const INVALID_SCALE: &str = "INVALID_SCALE";
    pub const MODEL_NOT_FOUND: &str = "MODEL_NOT_FOUND";
    pub const MODEL_NOT_LOADED: &str = "MODEL_NOT_LOADED";
    pub const MODEL_LOAD_ERROR: &str = "MODEL_LOAD_ERROR";
    pub const MODEL_DOWNLOAD_ERROR: &str = "MODEL_DOWNLOAD_ERROR";
    pub const MODEL_PREDICTION_ERROR: &str = "MODEL_PREDICTION_ERROR";
    pub const IMAGE_PROCESSING_ERROR: &str = "IMAGE_PROCESSING_ERROR";
    pub const SAVE_ERROR: &str = "SAVE_ERROR";
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
}

/// One incoming call: a method name plus its keyed arguments.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl MethodCall {
    /// `arguments` must be a JSON object; anything else is treated as empty.
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// The only error shape that crosses the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct ChannelError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ChannelError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }
}

fn source_text(e: &dyn std::error::Error) -> Option<String> {
    e.source().map(|s| s.to_string())
}

fn session_error_code(e: &SessionError) -> &'static str {
    match e {
        SessionError::ModelUnavailable { .. } => codes::MODEL_DOWNLOAD_ERROR,
        SessionError::ModelNotFound(_) => codes::MODEL_NOT_FOUND,
        SessionError::ModelLoad { .. } => codes::MODEL_LOAD_ERROR,
        SessionError::Inference { .. } => codes::MODEL_PREDICTION_ERROR,
        SessionError::NotLoaded(_) => codes::MODEL_NOT_LOADED,
    }
}

impl From<SessionError> for ChannelError {
    fn from(e: SessionError) -> Self {
        ChannelError::new(session_error_code(&e), e.to_string()).with_details(source_text(&e))
    }
}

impl From<TransformError> for ChannelError {
    fn from(e: TransformError) -> Self {
        let code = match &e {
            TransformError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            TransformError::InvalidScale(_) => codes::INVALID_SCALE,
            TransformError::Input(_) => codes::INVALID_IMAGE,
            TransformError::ModelUnavailable(inner) | TransformError::Inference(inner) => session_error_code(inner),
            TransformError::Processing(_) => codes::IMAGE_PROCESSING_ERROR,
            TransformError::Persistence(_) => codes::SAVE_ERROR,
        };
        ChannelError::new(code, e.to_string()).with_details(source_text(&e))
    }
}

/// A finished call, delivered through the completion queue.
#[derive(Debug, Clone)]
pub struct MethodResponse {
    pub id: u64,
    pub method: String,
    pub result: Result<Value, ChannelError>,
}

// ============================================================================
// ARGUMENT PARSING
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Command {
    GetModelStatus { model: String },
    LoadModel { path: PathBuf, model: String },
    UnloadModel { model: String },
    DownloadModel { model: String },
    Transform(TransformRequest),
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ChannelError> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(ChannelError::new(codes::INVALID_ARGUMENT, format!("{} is required", key)))
        }
        Some(_) => Err(ChannelError::new(codes::INVALID_ARGUMENT, format!("{} must be a string", key))),
    }
}

fn optional_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, ChannelError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_str(args, key).map(Some),
    }
}

fn parse_scale(args: &Map<String, Value>) -> Result<UpscaleFactor, ChannelError> {
    let raw = args
        .get("scale")
        .ok_or_else(|| ChannelError::new(codes::INVALID_ARGUMENT, "scale is required"))?;
    let scale = match raw {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.fract() == 0.0 => f as i64,
            _ => return Err(ChannelError::new(codes::INVALID_SCALE, format!("scale {} is not an integer", n))),
        },
        _ => return Err(ChannelError::new(codes::INVALID_ARGUMENT, "scale must be a number")),
    };
    UpscaleFactor::try_from(scale).map_err(ChannelError::from)
}

impl Command {
    fn parse(call: &MethodCall) -> Result<Command, ChannelError> {
        let args = &call.arguments;
        let image_path = || required_str(args, "imagePath").map(PathBuf::from);
        let transform = |operation: Operation| -> Result<Command, ChannelError> {
            Ok(Command::Transform(TransformRequest {
                image_path: image_path()?,
                operation,
            }))
        };
        let model_or_default = || -> Result<String, ChannelError> {
            Ok(optional_str(args, "modelName")?.unwrap_or(DEFAULT_MODEL).to_string())
        };

        match call.method.as_str() {
            "getModelStatus" => Ok(Command::GetModelStatus { model: model_or_default()? }),
            "loadModel" => Ok(Command::LoadModel {
                path: PathBuf::from(required_str(args, "modelPath")?),
                model: model_or_default()?,
            }),
            "unloadModel" => Ok(Command::UnloadModel { model: model_or_default()? }),
            "downloadModel" => Ok(Command::DownloadModel {
                model: required_str(args, "modelName")?.to_string(),
            }),
            "removeBackground" => transform(Operation::RemoveBackground),
            "portraitMode" => transform(Operation::PortraitMode),
            "autoEnhance" => transform(Operation::AutoEnhance),
            "reduceNoise" => transform(Operation::ReduceNoise),
            "upscale" => {
                let factor = parse_scale(args)?;
                transform(Operation::Upscale(factor))
            }
            "applyFilter" => {
                let name = required_str(args, "filterName")?;
                let filter = NamedFilter::parse(name).ok_or_else(|| {
                    ChannelError::new(codes::INVALID_ARGUMENT, format!("unknown filter '{}'", name))
                })?;
                transform(Operation::ApplyFilter(filter))
            }
            "applyAdjustments" => {
                let adjustments = match args.get("adjustments") {
                    Some(Value::Object(map)) => serde_json::from_value::<Adjustments>(Value::Object(map.clone()))
                        .map_err(|e| ChannelError::new(codes::INVALID_ARGUMENT, format!("adjustments: {}", e)))?,
                    _ => {
                        return Err(ChannelError::new(
                            codes::INVALID_ARGUMENT,
                            "adjustments map is required",
                        ));
                    }
                };
                transform(Operation::ApplyAdjustments(adjustments))
            }
            "inpaint" => {
                let mask_path = PathBuf::from(required_str(args, "maskPath")?);
                transform(Operation::Inpaint { mask_path })
            }
            other => Err(ChannelError::new(
                codes::NOT_IMPLEMENTED,
                format!("method '{}' is not implemented", other),
            )),
        }
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

struct Executor {
    orchestrator: Orchestrator,
}

impl Executor {
    fn execute(&self, command: Command) -> Result<Value, ChannelError> {
        let sessions = self.orchestrator.sessions();
        match command {
            Command::GetModelStatus { model } => Ok(Value::Bool(sessions.is_loaded(&model))),
            Command::LoadModel { path, model } => {
                let path = absolute_path(path);
                if !path.exists() {
                    return Err(ChannelError::new(
                        codes::MODEL_NOT_FOUND,
                        format!("model file not found: {}", path.display()),
                    ));
                }
                validate_native_path(&path, &["onnx", "ort"])
                    .map_err(|msg| ChannelError::new(codes::INVALID_ARGUMENT, msg))?;
                sessions.load_from_path(&model, &path)?;
                Ok(Value::Bool(true))
            }
            Command::UnloadModel { model } => {
                // Unloading something that isn't loaded is a successful no-op.
                let was_loaded = sessions.unload(&model);
                debug!(model = %model, was_loaded, "unloadModel");
                Ok(Value::Bool(true))
            }
            Command::DownloadModel { model } => {
                let descriptor = self.orchestrator.registry().get(&model).ok_or_else(|| {
                    ChannelError::new(codes::MODEL_NOT_FOUND, format!("unknown model '{}'", model))
                })?;
                let path = sessions.cache().ensure_available(descriptor).map_err(|e| {
                    ChannelError::new(codes::MODEL_DOWNLOAD_ERROR, e.to_string())
                })?;
                Ok(Value::String(path.display().to_string()))
            }
            Command::Transform(request) => {
                let path = self.orchestrator.execute(&request)?;
                Ok(Value::String(path.display().to_string()))
            }
        }
    }

    /// Run a command, turning a worker panic into an error response.
    fn execute_guarded(&self, command: Command) -> Result<Value, ChannelError> {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.execute(command))).unwrap_or_else(|_| {
            Err(ChannelError::new(
                codes::IMAGE_PROCESSING_ERROR,
                "worker panicked while handling the call",
            ))
        })
    }
}

/// Everything needed to assemble a [`Bridge`] apart from the runtime and
/// fetcher.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub models_dir: PathBuf,
    pub bundled_models_dir: Option<PathBuf>,
    pub output: OutputOptions,
    pub mask: MaskSettings,
    pub session: SessionConfig,
}

impl BridgeConfig {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            models_dir: settings.models_dir.clone(),
            bundled_models_dir: settings.bundled_models_dir.clone(),
            output: OutputOptions {
                dir: settings.output_dir.clone(),
                format: settings.output_format,
                jpeg_quality: settings.jpeg_quality,
            },
            mask: settings.mask_settings(),
            session: SessionConfig {
                prefer_acceleration: settings.prefer_gpu,
                intra_op_threads: settings.intra_op_threads,
            },
        }
    }

    /// Defaults rooted at `root`: `root/models` and `root/output`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            models_dir: root.join("models"),
            bundled_models_dir: None,
            output: OutputOptions::png(root.join("output")),
            mask: MaskSettings::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Method-call front end over the model pipeline.
pub struct Bridge {
    executor: Arc<Executor>,
    progress: ProgressHub,
    next_id: AtomicU64,
    completions_tx: Sender<MethodResponse>,
    completions_rx: Mutex<Receiver<MethodResponse>>,
}

impl Bridge {
    /// Production wiring: ONNX Runtime + HTTP fetcher + built-in models.
    pub fn from_settings(settings: &BridgeSettings) -> Result<Self, ChannelError> {
        let fetcher = HttpFetcher::new()
            .map_err(|e| ChannelError::new(codes::MODEL_DOWNLOAD_ERROR, e.to_string()))?;
        let runtime = OnnxRuntime::new(settings.onnx_runtime_path.clone());
        Ok(Self::with_parts(
            ModelRegistry::builtin(&settings.model_base_url),
            Arc::new(runtime),
            Arc::new(fetcher),
            BridgeConfig::from_settings(settings),
        ))
    }

    pub fn with_parts(
        registry: ModelRegistry,
        runtime: Arc<dyn InferenceRuntime>,
        fetcher: Arc<dyn ArchiveFetcher>,
        config: BridgeConfig,
    ) -> Self {
        let progress = ProgressHub::new();
        let cache = Arc::new(ModelCache::new(
            config.models_dir,
            config.bundled_models_dir,
            fetcher,
            progress.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(runtime, cache, config.session));
        let orchestrator = Orchestrator::new(registry, sessions, config.output, config.mask);
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            executor: Arc::new(Executor { orchestrator }),
            progress,
            next_id: AtomicU64::new(1),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
        }
    }

    pub fn subscribe_progress(&self) -> Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.executor.orchestrator.sessions()
    }

    pub fn registry(&self) -> &ModelRegistry {
        self.executor.orchestrator.registry()
    }

    /// Queue a call. Argument errors are reported straight away; everything
    /// else runs on a background worker. Returns the id the response will
    /// carry.
    pub fn call(&self, call: MethodCall) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = call.method.clone();
        let tx = self.completions_tx.clone();

        let command = match Command::parse(&call) {
            Ok(c) => c,
            Err(e) => {
                warn!(id, method = %method, "rejected call: {}", e);
                let _ = tx.send(MethodResponse {
                    id,
                    method,
                    result: Err(e),
                });
                return id;
            }
        };

        let executor = self.executor.clone();
        rayon::spawn(move || {
            let result = executor.execute_guarded(command);
            let _ = tx.send(MethodResponse { id, method, result });
        });
        id
    }

    /// All responses that have arrived so far, without blocking.
    pub fn drain_completions(&self) -> Vec<MethodResponse> {
        let rx = self.completions_rx.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while let Ok(resp) = rx.try_recv() {
            out.push(resp);
        }
        out
    }

    /// Block up to `timeout` for the next response.
    pub fn wait_completion(&self, timeout: Duration) -> Option<MethodResponse> {
        let rx = self.completions_rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.recv_timeout(timeout).ok()
    }

    /// Run a call on a background worker and block for its result. Does not
    /// go through the completion queue.
    pub fn invoke(&self, call: MethodCall) -> Result<Value, ChannelError> {
        let command = Command::parse(&call)?;
        let executor = self.executor.clone();
        let (tx, rx) = mpsc::channel();
        rayon::spawn(move || {
            let _ = tx.send(executor.execute_guarded(command));
        });
        rx.recv().unwrap_or_else(|_| {
            Err(ChannelError::new(
                codes::IMAGE_PROCESSING_ERROR,
                "worker exited without a result",
            ))
        })
    }
}
