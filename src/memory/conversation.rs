//! Conversation Memory - persona selection and windowed prompt assembly
//!
//! Pure functions only: the same history and message always yield the same
//! prompt and the same kept history.

use serde::{Deserialize, Serialize};

use crate::error::{FriendError, Result};
use crate::memory::Turn;

const CHARACTER: &str = "You are Harry Potter, an 11 year old boy who has just discovered he is a wizard and has \
    been invited to attend Hogwarts School of Witchcraft and Wizardry. You grew up with your aunt and uncle, the \
    Dursleys, who treated you poorly and kept your magical abilities hidden from you. At Hogwarts, you learn magic, \
    play quidditch, and make close friends with Ron Weasley and Hermione Granger. You have black hair, green eyes, \
    and a lightning bolt scar on your forehead from surviving an attack as a baby from the evil Voldemort. ";

const INTRODUCTION_STYLE: &str = "Respond to users in a briefly, friendly, curious, humble and sometimes \
    mischievous way, as an 11 year old Harry Potter would. Display knowledge about the wizarding world, Hogwarts, \
    spells, magical creatures, quidditch and relationships between characters. Be helpful, brave and honest but do \
    not reveal major plot spoilers from the Harry Potter books and movies.";

const FRIEND_STYLE: &str = "Respond to the user briefly and concisely as if you are best friends sharing your \
    innermost thoughts, feelings, hopes and dreams. Be warm, curious, loyal and offer thoughtful advice when needed. \
    Ask questions about his interests and life outside Hogwarts. Share stories and jokes to make him smile.Remain \
    positive even when facing challenges. Act as his supportive confidant who knows him better than anyone else.";

const FLIRTY_SUFFIX: &str = " Be playful and flirty but always respect your boundaries.";

const CONVERSATION_FRAME: &str = "\nThe following is a conversation between a human an AI in a messenger. \
    You're AI in this conversation. The AI acts exactly like Harry Potter.\nCurrent conversation:\n";

/// Greeting the UI shows before the first exchange
pub const AI_FIRST_MESSAGE: &str = "Well hello there! I'm Harry Potter, and I'm excited to meet you! I'm still \
    getting used to this whole wizarding world thing, but I'm eager to learn all about it. What brings you here \
    today? Do you have any burning questions about Hogwarts, magic spells, or anything else? I'm happy to share \
    what I know, and maybe we can learn something new together!";

/// Persona the model is asked to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Introduction,
    Friend,
    Flirty,
}

impl Persona {
    /// Pick a persona from the first turn of the history.
    ///
    /// The metric is the key count of the oldest turn's record, not the
    /// length of the conversation. See DESIGN.md before changing it.
    pub fn select(history: &[Turn], settings: &ConversationSettings) -> Self {
        let Some(first) = history.first() else {
            return Persona::Introduction;
        };

        let metric = first.field_count();
        if metric > settings.flirty_threshold {
            Persona::Flirty
        } else if metric > settings.friend_threshold {
            Persona::Friend
        } else {
            Persona::Introduction
        }
    }

    fn preamble(&self) -> String {
        match self {
            Persona::Introduction => format!("{}{}", CHARACTER, INTRODUCTION_STYLE),
            Persona::Friend => format!("{}{}", CHARACTER, FRIEND_STYLE),
            Persona::Flirty => format!("{}{}{}", CHARACTER, FRIEND_STYLE, FLIRTY_SUFFIX),
        }
    }

    /// Fill the template. History and input are inserted in one pass, so
    /// brace sequences inside user text are never treated as placeholders.
    pub fn render(&self, history: &str, input: &str) -> String {
        format!("{}{}{}\nHuman: {}\nAI:", self.preamble(), CONVERSATION_FRAME, history, input)
    }
}

/// Knobs for prompt assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSettings {
    /// Number of most recent turns kept in the prompt
    pub window: usize,
    pub friend_threshold: usize,
    pub flirty_threshold: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            window: 40,
            friend_threshold: 15,
            flirty_threshold: 30,
        }
    }
}

/// Output of [`build_prompt`]
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub prompt: String,
    pub persona: Persona,
    pub kept_history: Vec<Turn>,
}

/// Keep the most recent `window` turns, oldest first
pub fn window_history(history: &[Turn], window: usize) -> Vec<Turn> {
    let start = history.len().saturating_sub(window);
    history[start..].to_vec()
}

/// Render turns as `Human: ...` / `AI: ...` lines
pub fn format_history(history: &[Turn]) -> String {
    history.iter().map(Turn::render).collect::<Vec<_>>().join("\n")
}

/// Assemble the prompt for `message` given the prior `history`
pub fn build_prompt(history: &[Turn], message: &str, settings: &ConversationSettings) -> Result<PromptContext> {
    if message.is_empty() {
        return Err(FriendError::InvalidInput("Human message is empty".to_string()));
    }

    let persona = Persona::select(history, settings);
    let kept_history = window_history(history, settings.window);
    let prompt = persona.render(&format_history(&kept_history), message);

    Ok(PromptContext {
        prompt,
        persona,
        kept_history,
    })
}

/// History returned to the caller: the kept window plus the new exchange
pub fn extend_history(kept_history: Vec<Turn>, message: &str, reply: &str) -> Vec<Turn> {
    let mut updated = kept_history;
    updated.push(Turn::human(message));
    updated.push(Turn::ai(reply));
    updated
}
