//! Model backends
pub mod gguf;

pub use gguf::{fetch_artifacts, GgufGenerator, GgufLoader, ModelFiles};
