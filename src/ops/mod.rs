//! Model-free pixel operations.

pub mod adjustments;
pub mod filters;

pub use adjustments::{Adjustments, NamedFilter};
