// ============================================================================
// ONNX RUNTIME ADAPTER: dynamic C-API bindings
// ============================================================================
//
// Loads onnxruntime.dll / libonnxruntime.so / libonnxruntime.dylib through
// `libloading` so the binary has no link-time dependency on ONNX Runtime.
// Only the handful of vtable entries the bridge needs are bound.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{Acceleration, ExecutionProvider, InferenceRuntime, LoadedModel, RuntimeError};
use crate::tensor::{ImageTensor, element_count};

// --- opaque handles ---------------------------------------------------------

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}

/// ORT API version we request from `OrtGetApiBase`.
const ORT_API_VERSION: u32 = 18;
/// `OrtGetApi(ORT_API_VERSION)` returns null on anything older.
const ORT_MIN_VERSION: (u32, u32) = (1, 18);
/// ORT_ENABLE_ALL
const GRAPH_OPT_ALL: u32 = 99;

const LOG_LEVEL_WARNING: u32 = 2;
const ELEMENT_TYPE_FLOAT: u32 = 1;
const ALLOCATOR_ARENA: i32 = 1;
const MEM_TYPE_DEFAULT: i32 = 0;

#[cfg(windows)]
type OrtChar = u16;
#[cfg(not(windows))]
type OrtChar = c_char;

type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const c_char;
type CreateEnvFn =
    unsafe extern "C" fn(log_level: u32, logid: *const c_char, out: *mut *mut OrtEnv) -> *mut OrtStatus;
type CreateSessionFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_path: *const OrtChar,
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;
type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const c_char,
    inputs: *const *const OrtValue,
    input_len: usize,
    output_names: *const *const c_char,
    output_len: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;
type CreateSessionOptionsFn = unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;
type SetGraphOptimizationLevelFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, level: u32) -> *mut OrtStatus;
type SetIntraOpNumThreadsFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, threads: i32) -> *mut OrtStatus;
type SessionGetCountFn = unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;
type SessionGetNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut c_char,
) -> *mut OrtStatus;
type CreateTensorWithDataFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: u32,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;
type GetTensorMutableDataFn = unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut c_void) -> *mut OrtStatus;
type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;
type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    values: *mut i64,
    len: usize,
) -> *mut OrtStatus;
type GetTensorTypeAndShapeFn = unsafe extern "C" fn(
    value: *const OrtValue,
    out: *mut *mut OrtTensorTypeAndShapeInfo,
) -> *mut OrtStatus;
type CreateCpuMemoryInfoFn =
    unsafe extern "C" fn(alloc_type: i32, mem_type: i32, out: *mut *mut OrtMemoryInfo) -> *mut OrtStatus;
type AllocatorFreeFn = unsafe extern "C" fn(allocator: *mut OrtAllocator, ptr: *mut c_void) -> *mut OrtStatus;
type GetAllocatorWithDefaultOptionsFn = unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;
type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);

/// Exported by CUDA-enabled builds only.
type AppendCudaFn = unsafe extern "C" fn(options: *mut OrtSessionOptions, device_id: i32) -> *mut OrtStatus;

#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const c_void,
    get_version_string: unsafe extern "C" fn() -> *const c_char,
}

/// The OrtApi vtable, indexed by position (see onnxruntime_c_api.h).
struct OrtApi {
    raw: *const c_void,
}

impl OrtApi {
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let ptr = self.raw as *const *const c_void;
        let fn_ptr = *ptr.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    //  2: GetErrorMessage   3: CreateEnv   7: CreateSession   9: Run
    // 10: CreateSessionOptions  23: SetSessionGraphOptimizationLevel
    // 24: SetIntraOpNumThreads  30/31: SessionGetInput/OutputCount
    // 36/37: SessionGetInput/OutputName  49: CreateTensorWithDataAsOrtValue
    // 51: GetTensorMutableData  61: GetDimensionsCount  62: GetDimensions
    // 65: GetTensorTypeAndShape  69: CreateCpuMemoryInfo  76: AllocatorFree
    // 78: GetAllocatorWithDefaultOptions  92..100: Release*

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session(&self) -> CreateSessionFn {
        unsafe { self.get_fn(7) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn session_get_input_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(30) }
    }
    fn session_get_output_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(31) }
    }
    fn session_get_input_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(36) }
    }
    fn session_get_output_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Turn an OrtStatus into a Result, releasing the status.
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        return Ok(());
    }
    let msg_ptr = (api.get_error_message())(status);
    let msg = if msg_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
    };
    (api.release_status())(status);
    Err(msg)
}

/// Reject relative paths, `..` traversal and unexpected extensions before
/// handing a path to the native loader.
pub fn validate_native_path(path: &Path, allowed_exts: &[&str]) -> Result<(), String> {
    if path.as_os_str().is_empty() {
        return Err("path is empty".to_string());
    }
    if !path.is_absolute() {
        return Err(format!("{} is not an absolute path", path.display()));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(format!("{} must not contain '..' components", path.display()));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !allowed_exts.contains(&ext.as_str()) {
        return Err(format!(
            "expected a .{} file, got '.{}'",
            allowed_exts.join("/."),
            ext
        ));
    }
    Ok(())
}

/// Parse "1.18.0" into (1, 18).
fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

fn is_supported_version(version: &str) -> bool {
    match parse_ort_version(version) {
        Some((major, minor)) => {
            let (min_major, min_minor) = ORT_MIN_VERSION;
            major > min_major || (major == min_major && minor >= min_minor)
        }
        // Unparseable builds (custom forks) are given the benefit of the doubt.
        None => true,
    }
}

#[cfg(windows)]
fn ort_path(path: &Path) -> Result<Vec<OrtChar>, RuntimeError> {
    use std::os::windows::ffi::OsStrExt;
    Ok(path.as_os_str().encode_wide().chain(std::iter::once(0)).collect())
}

#[cfg(not(windows))]
fn ort_path(path: &Path) -> Result<Vec<OrtChar>, RuntimeError> {
    let s = path
        .to_str()
        .ok_or_else(|| RuntimeError::Load(format!("{} is not valid UTF-8", path.display())))?;
    let c = CString::new(s).map_err(|e| RuntimeError::Load(e.to_string()))?;
    Ok(c.into_bytes_with_nul().into_iter().map(|b| b as OrtChar).collect())
}

// ============================================================================
// LIBRARY + ENVIRONMENT
// ============================================================================

/// A loaded ONNX Runtime library with its process-wide environment.
struct OrtLibrary {
    api: OrtApi,
    env: *mut OrtEnv,
    append_cuda: Option<AppendCudaFn>,
    version: String,
    // Last field: dropped after `env` has been released.
    _lib: libloading::Library,
}

// The OrtApi vtable and OrtEnv are documented as thread-safe.
unsafe impl Send for OrtLibrary {}
unsafe impl Sync for OrtLibrary {}

impl OrtLibrary {
    fn open(dll_path: &Path) -> Result<Self, RuntimeError> {
        validate_native_path(dll_path, &["dll", "so", "dylib"]).map_err(RuntimeError::Unavailable)?;
        if !dll_path.exists() {
            return Err(RuntimeError::Unavailable(format!(
                "ONNX Runtime library not found at {}",
                dll_path.display()
            )));
        }

        unsafe {
            let lib = libloading::Library::new(dll_path)
                .map_err(|e| RuntimeError::Unavailable(format!("failed to load library: {}", e)))?;

            let api_base = {
                let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> = lib
                    .get(b"OrtGetApiBase")
                    .map_err(|e| RuntimeError::Unavailable(format!("symbol OrtGetApiBase not found: {}", e)))?;
                get_api_base()
            };
            if api_base.is_null() {
                return Err(RuntimeError::Unavailable("OrtGetApiBase returned null".to_string()));
            }

            let version_ptr = ((*api_base).get_version_string)();
            let version = if version_ptr.is_null() {
                "unknown".to_string()
            } else {
                CStr::from_ptr(version_ptr).to_string_lossy().into_owned()
            };
            if !is_supported_version(&version) {
                return Err(RuntimeError::Unavailable(format!(
                    "ONNX Runtime {} is too old, {}.{} or newer is required",
                    version, ORT_MIN_VERSION.0, ORT_MIN_VERSION.1
                )));
            }

            let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
            if api_ptr.is_null() {
                return Err(RuntimeError::Unavailable(format!(
                    "OrtGetApi({}) returned null for runtime {}",
                    ORT_API_VERSION, version
                )));
            }
            let api = OrtApi { raw: api_ptr };

            let append_cuda = lib
                .get::<AppendCudaFn>(b"OrtSessionOptionsAppendExecutionProvider_CUDA")
                .ok()
                .map(|sym| *sym);

            let log_id = CString::new("photobridge").map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
            let mut env: *mut OrtEnv = std::ptr::null_mut();
            status_to_result(&api, (api.create_env())(LOG_LEVEL_WARNING, log_id.as_ptr(), &mut env))
                .map_err(RuntimeError::Unavailable)?;

            info!(
                "ONNX Runtime {} loaded from {} (cuda provider: {})",
                version,
                dll_path.display(),
                append_cuda.is_some()
            );
            Ok(Self {
                api,
                env,
                append_cuda,
                version,
                _lib: lib,
            })
        }
    }
}

impl Drop for OrtLibrary {
    fn drop(&mut self) {
        if !self.env.is_null() {
            unsafe { (self.api.release_env())(self.env) };
        }
    }
}

/// Load the library at `dll_path` just long enough to read its version.
pub fn probe_onnx_runtime(dll_path: &Path) -> Result<String, RuntimeError> {
    OrtLibrary::open(dll_path).map(|lib| lib.version.clone())
}

// ============================================================================
// RUNTIME
// ============================================================================

/// [`InferenceRuntime`] backed by a dynamically loaded ONNX Runtime.
/// The library is opened on first use and shared by every model.
pub struct OnnxRuntime {
    library_path: Option<PathBuf>,
    library: Mutex<Option<Arc<OrtLibrary>>>,
}

impl OnnxRuntime {
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self {
            library_path,
            library: Mutex::new(None),
        }
    }

    fn library(&self) -> Result<Arc<OrtLibrary>, RuntimeError> {
        let mut slot = self.library.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lib) = slot.as_ref() {
            return Ok(lib.clone());
        }
        let path = self.library_path.as_ref().ok_or_else(|| {
            RuntimeError::Unavailable("no ONNX Runtime library configured (onnx_runtime_path)".to_string())
        })?;
        let lib = Arc::new(OrtLibrary::open(path)?);
        *slot = Some(lib.clone());
        Ok(lib)
    }
}

impl InferenceRuntime for OnnxRuntime {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn load(
        &self,
        path: &Path,
        acceleration: Acceleration,
        intra_op_threads: usize,
    ) -> Result<Box<dyn LoadedModel>, RuntimeError> {
        validate_native_path(path, &["onnx", "ort"]).map_err(RuntimeError::Load)?;
        let lib = self.library()?;
        let model = OnnxModel::create(lib, path, acceleration, intra_op_threads)?;
        Ok(Box::new(model))
    }
}

// ============================================================================
// MODEL
// ============================================================================

struct OnnxModel {
    lib: Arc<OrtLibrary>,
    session: *mut OrtSession,
    memory_info: *mut OrtMemoryInfo,
    input_name: CString,
    output_name: CString,
    provider: ExecutionProvider,
}

// OrtSession::Run may be called concurrently.
unsafe impl Send for OnnxModel {}
unsafe impl Sync for OnnxModel {}

impl OnnxModel {
    fn create(
        lib: Arc<OrtLibrary>,
        path: &Path,
        acceleration: Acceleration,
        intra_op_threads: usize,
    ) -> Result<Self, RuntimeError> {
        let api = &lib.api;
        let model_path = ort_path(path)?;

        unsafe {
            // -- session options --
            let mut options: *mut OrtSessionOptions = std::ptr::null_mut();
            status_to_result(api, (api.create_session_options())(&mut options)).map_err(RuntimeError::Load)?;

            let threads = intra_op_threads.clamp(1, i32::MAX as usize) as i32;
            if let Err(e) = status_to_result(api, (api.set_intra_op_num_threads())(options, threads)) {
                warn!("SetIntraOpNumThreads({}) failed: {}", threads, e);
            }
            if let Err(e) = status_to_result(
                api,
                (api.set_session_graph_optimization_level())(options, GRAPH_OPT_ALL),
            ) {
                warn!("SetSessionGraphOptimizationLevel failed: {}", e);
            }

            let provider = match acceleration {
                Acceleration::CpuOnly => ExecutionProvider::Cpu,
                Acceleration::Preferred => {
                    let Some(append) = lib.append_cuda else {
                        (api.release_session_options())(options);
                        return Err(RuntimeError::AccelerationUnavailable(
                            "runtime was built without the CUDA provider".to_string(),
                        ));
                    };
                    if let Err(e) = status_to_result(api, append(options, 0)) {
                        (api.release_session_options())(options);
                        return Err(RuntimeError::AccelerationUnavailable(e));
                    }
                    ExecutionProvider::Gpu
                }
            };

            // -- session --
            let mut session: *mut OrtSession = std::ptr::null_mut();
            let status = (api.create_session())(lib.env, model_path.as_ptr(), options, &mut session);
            (api.release_session_options())(options);
            if let Err(e) = status_to_result(api, status) {
                return Err(match provider {
                    ExecutionProvider::Gpu => RuntimeError::AccelerationUnavailable(e),
                    ExecutionProvider::Cpu => RuntimeError::Load(e),
                });
            }

            // -- io names --
            let names = session_io_names(api, session);
            let (input_name, output_name) = match names {
                Ok(n) => n,
                Err(e) => {
                    (api.release_session())(session);
                    return Err(RuntimeError::Load(e));
                }
            };

            let mut memory_info: *mut OrtMemoryInfo = std::ptr::null_mut();
            if let Err(e) = status_to_result(
                api,
                (api.create_cpu_memory_info())(ALLOCATOR_ARENA, MEM_TYPE_DEFAULT, &mut memory_info),
            ) {
                (api.release_session())(session);
                return Err(RuntimeError::Load(e));
            }

            debug!(
                "Session for {} ready: input '{}', output '{}', provider {}",
                path.display(),
                input_name.to_string_lossy(),
                output_name.to_string_lossy(),
                provider.as_str()
            );
            Ok(Self {
                lib,
                session,
                memory_info,
                input_name,
                output_name,
                provider,
            })
        }
    }
}

/// Names of the first input and first output of a session.
unsafe fn session_io_names(api: &OrtApi, session: *mut OrtSession) -> Result<(CString, CString), String> {
    let mut inputs = 0usize;
    let mut outputs = 0usize;
    status_to_result(api, (api.session_get_input_count())(session, &mut inputs))?;
    status_to_result(api, (api.session_get_output_count())(session, &mut outputs))?;
    if inputs == 0 || outputs == 0 {
        return Err(format!("model has {} input(s) and {} output(s)", inputs, outputs));
    }

    let mut allocator: *mut OrtAllocator = std::ptr::null_mut();
    status_to_result(api, (api.get_allocator_with_default_options())(&mut allocator))?;

    let input = session_name(api, session, allocator, api.session_get_input_name())?;
    let output = session_name(api, session, allocator, api.session_get_output_name())?;
    Ok((input, output))
}

unsafe fn session_name(
    api: &OrtApi,
    session: *mut OrtSession,
    allocator: *mut OrtAllocator,
    getter: SessionGetNameFn,
) -> Result<CString, String> {
    let mut name_ptr: *mut c_char = std::ptr::null_mut();
    status_to_result(api, getter(session, 0, allocator, &mut name_ptr))?;
    if name_ptr.is_null() {
        return Err("runtime returned a null tensor name".to_string());
    }
    let name = CStr::from_ptr(name_ptr).to_owned();
    let _ = status_to_result(api, (api.allocator_free())(allocator, name_ptr as *mut c_void));
    Ok(name)
}

impl LoadedModel for OnnxModel {
    fn run(&self, input: &ImageTensor) -> Result<ImageTensor, RuntimeError> {
        let expected = element_count(&input.shape);
        if input.data.len() != expected {
            return Err(RuntimeError::ShapeMismatch {
                shape: input.shape.clone(),
                expected,
                actual: input.data.len(),
            });
        }

        let api = &self.lib.api;
        let mut data = input.data.clone();
        let shape: Vec<i64> = input.shape.iter().map(|&d| d as i64).collect();

        unsafe {
            let mut input_value: *mut OrtValue = std::ptr::null_mut();
            status_to_result(
                api,
                (api.create_tensor_with_data())(
                    self.memory_info,
                    data.as_mut_ptr() as *mut c_void,
                    data.len() * std::mem::size_of::<f32>(),
                    shape.as_ptr(),
                    shape.len(),
                    ELEMENT_TYPE_FLOAT,
                    &mut input_value,
                ),
            )
            .map_err(|e| RuntimeError::Run(format!("create input tensor: {}", e)))?;

            let input_names = [self.input_name.as_ptr()];
            let output_names = [self.output_name.as_ptr()];
            let inputs = [input_value as *const OrtValue];
            let mut output_value: *mut OrtValue = std::ptr::null_mut();

            let status = (api.run())(
                self.session,
                std::ptr::null(),
                input_names.as_ptr(),
                inputs.as_ptr(),
                1,
                output_names.as_ptr(),
                1,
                &mut output_value,
            );
            (api.release_value())(input_value);
            status_to_result(api, status).map_err(RuntimeError::Run)?;
            if output_value.is_null() {
                return Err(RuntimeError::Run("runtime produced no output".to_string()));
            }

            let result = read_output(api, output_value, input.layout);
            (api.release_value())(output_value);
            result
        }
    }

    fn provider(&self) -> ExecutionProvider {
        self.provider
    }
}

unsafe fn read_output(
    api: &OrtApi,
    value: *mut OrtValue,
    layout: crate::tensor::TensorLayout,
) -> Result<ImageTensor, RuntimeError> {
    let mut info: *mut OrtTensorTypeAndShapeInfo = std::ptr::null_mut();
    status_to_result(api, (api.get_tensor_type_and_shape())(value, &mut info)).map_err(RuntimeError::Run)?;

    let mut rank = 0usize;
    let dims_result = status_to_result(api, (api.get_dimensions_count())(info, &mut rank)).and_then(|_| {
        let mut dims = vec![0i64; rank];
        status_to_result(api, (api.get_dimensions())(info, dims.as_mut_ptr(), rank)).map(|_| dims)
    });
    (api.release_tensor_type_and_shape_info())(info);
    let dims = dims_result.map_err(RuntimeError::Run)?;

    if dims.iter().any(|&d| d < 0) {
        return Err(RuntimeError::Run(format!("output has dynamic dims {:?}", dims)));
    }
    let shape: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
    let total = element_count(&shape);

    let mut data_ptr: *mut c_void = std::ptr::null_mut();
    status_to_result(api, (api.get_tensor_mutable_data())(value, &mut data_ptr)).map_err(RuntimeError::Run)?;
    if data_ptr.is_null() && total > 0 {
        return Err(RuntimeError::Run("output tensor has no data".to_string()));
    }
    let data = if total == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data_ptr as *const f32, total).to_vec()
    };
    ImageTensor::new(data, shape, layout).map_err(|e| RuntimeError::Run(e.to_string()))
}

impl Drop for OnnxModel {
    fn drop(&mut self) {
        unsafe {
            (self.lib.api.release_session())(self.session);
            (self.lib.api.release_memory_info())(self.memory_info);
        }
    }
}
