//! PhotoBridge: on-device model-backed photo transforms.
//!
//! A method-call surface ([`channel::Bridge`]) drives the transform pipeline
//! ([`pipeline::Orchestrator`]), which fetches models into a local store
//! ([`models::ModelCache`]), runs them through a pluggable runtime
//! ([`inference::InferenceRuntime`]) and converts between images and tensors
//! ([`tensor`]). Upscale, enhance and denoise fall back to plain filters when
//! no model is usable.

pub mod channel;
pub mod cli;
pub mod inference;
pub mod io;
pub mod logger;
pub mod models;
pub mod ops;
pub mod pipeline;
pub mod settings;
pub mod tensor;

pub use channel::{Bridge, BridgeConfig, ChannelError, MethodCall, MethodResponse};
pub use pipeline::{Operation, Orchestrator, TransformError, TransformRequest, UpscaleFactor};
