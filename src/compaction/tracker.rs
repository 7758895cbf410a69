//! Compaction thresholds and boundary selection.

use serde::{Deserialize, Serialize};

use super::{
    CHARS_PER_TOKEN, DEFAULT_MAX_ESTIMATED_TOKENS, DEFAULT_MAX_USER_TURNS, DEFAULT_PRESERVED_TAIL,
    IMAGE_TOKEN_SURCHARGE,
};
use crate::state::{ConversationMessage, ConversationState, Role};

/// Why compaction triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    Turns,
    Tokens,
}

#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    pub max_user_turns: usize,
    pub max_estimated_tokens: usize,
    pub preserved_tail: usize,
    pub image_token_surcharge: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_user_turns: DEFAULT_MAX_USER_TURNS,
            max_estimated_tokens: DEFAULT_MAX_ESTIMATED_TOKENS,
            preserved_tail: DEFAULT_PRESERVED_TAIL,
            image_token_surcharge: IMAGE_TOKEN_SURCHARGE,
        }
    }
}

impl CompactionPolicy {
    /// Estimate: character count / 4, plus a flat surcharge per image.
    pub fn estimated_tokens(&self, messages: &[ConversationMessage]) -> usize {
        messages
            .iter()
            .map(|m| m.char_count() / CHARS_PER_TOKEN + m.images.len() * self.image_token_surcharge)
            .sum()
    }

    /// Check the turn-count threshold first, then the token estimate.
    pub fn should_compact(&self, conversation: &ConversationState) -> Option<CompactionReason> {
        if conversation.user_turns() >= self.max_user_turns {
            return Some(CompactionReason::Turns);
        }
        if self.estimated_tokens(&conversation.running) >= self.max_estimated_tokens {
            return Some(CompactionReason::Tokens);
        }
        None
    }

    /// The latest user-message index at least `preserved_tail` messages
    /// from the end. The tail starting there is preserved whole, so an
    /// assistant/tool-call sequence is never split mid-turn. `None` means
    /// no safe cut exists.
    pub fn boundary(&self, messages: &[ConversationMessage]) -> Option<usize> {
        (1..messages.len())
            .rev()
            .filter(|&i| messages.len() - i >= self.preserved_tail)
            .find(|&i| messages[i].role == Role::User)
    }

    /// Fallback length when summarization is unavailable.
    pub fn truncation_len(&self) -> usize {
        self.preserved_tail * 3
    }
}
