//! Model runtime abstraction and the session layer on top of it.
//!
//! The pipeline only ever talks to [`InferenceRuntime`] / [`LoadedModel`];
//! the ONNX Runtime adapter lives in [`onnx`] and tests plug in their own.

pub mod onnx;
pub mod session;

use std::path::Path;
use thiserror::Error;

use crate::tensor::ImageTensor;

pub use onnx::OnnxRuntime;
pub use session::{Session, SessionConfig, SessionError, SessionManager};

/// Whether a load should try hardware acceleration first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceleration {
    Preferred,
    CpuOnly,
}

/// Where a loaded model actually executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cpu,
    Gpu,
}

impl ExecutionProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionProvider::Cpu => "cpu",
            ExecutionProvider::Gpu => "gpu",
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("inference runtime unavailable: {0}")]
    Unavailable(String),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("hardware acceleration unavailable: {0}")]
    AccelerationUnavailable(String),
    #[error("inference failed: {0}")]
    Run(String),
    #[error("tensor has {actual} values, shape {shape:?} needs {expected}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// A model ready to run. Dropping it releases the underlying resources.
pub trait LoadedModel: Send + Sync {
    fn run(&self, input: &ImageTensor) -> Result<ImageTensor, RuntimeError>;
    fn provider(&self) -> ExecutionProvider;
}

/// Something that can turn a compiled model file into a [`LoadedModel`].
pub trait InferenceRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn load(
        &self,
        path: &Path,
        acceleration: Acceleration,
        intra_op_threads: usize,
    ) -> Result<Box<dyn LoadedModel>, RuntimeError>;
}
