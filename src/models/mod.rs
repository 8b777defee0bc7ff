//! Model descriptors and the on-disk model store.

pub mod cache;
pub mod descriptor;
pub mod fetch;
pub mod progress;

pub use cache::{CacheError, CacheState, ModelCache};
pub use descriptor::{ModelDescriptor, ModelRegistry, OutputKind};
pub use fetch::{ArchiveFetcher, FetchError, HttpFetcher};
pub use progress::{ProgressEvent, ProgressHub};
