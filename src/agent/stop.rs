//! Stop-sequence guard
//!
//! Halts generation as soon as the model starts writing the next speaker's
//! turn (`Human:`, `AI:`, `User:`) instead of continuing the conversation on
//! its own.

use tracing::warn;

/// True when `generated` ends with any of `stop_sequences`
pub fn should_stop(generated: &[u32], stop_sequences: &[Vec<u32>]) -> bool {
    if generated.is_empty() {
        return false;
    }
    stop_sequences
        .iter()
        .any(|seq| !seq.is_empty() && generated.ends_with(seq))
}

/// Stop sequences resolved to token ids for one tokenizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopGuard {
    sequences: Vec<Vec<u32>>,
}

impl StopGuard {
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self {
            sequences: sequences.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Map token strings to ids with `lookup`.
    ///
    /// A sequence with a token the vocabulary does not know is dropped.
    pub fn resolve<F>(token_sequences: &[Vec<String>], mut lookup: F) -> Self
    where
        F: FnMut(&str) -> Option<u32>,
    {
        let mut sequences = Vec::with_capacity(token_sequences.len());
        for tokens in token_sequences {
            let ids: Option<Vec<u32>> = tokens.iter().map(|t| lookup(t)).collect();
            match ids {
                Some(ids) => sequences.push(ids),
                None => warn!("Skipping stop sequence {:?}: token missing from vocabulary", tokens),
            }
        }
        Self::new(sequences)
    }

    pub fn should_stop(&self, generated: &[u32]) -> bool {
        should_stop(generated, &self.sequences)
    }

    pub fn sequences(&self) -> &[Vec<u32>] {
        &self.sequences
    }
}
