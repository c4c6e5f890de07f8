//! Memory System Module
//!
//! Conversation turns, their wire format, and the windowed prompt builder.

pub mod conversation;
pub mod turn;

pub use conversation::{
    build_prompt, extend_history, format_history, window_history, ConversationSettings, Persona, PromptContext,
    AI_FIRST_MESSAGE,
};
pub use turn::{Role, Turn, TurnData};
