//! Agent Module
//!
//! The model-facing side of the service: generator and loader traits, the
//! once-per-worker model slot, the stop-sequence guard and reply cleanup.

mod lifecycle;
mod provider;
mod sanitize;
mod stop;

pub use lifecycle::ModelSlot;
pub use provider::{GenerationRequest, Interrupt, ModelLoader, TextGenerator};
pub use sanitize::sanitize;
pub use stop::{should_stop, StopGuard};
