//! Conversation compaction: bounding context size via summarization.
//!
//! The working history is compacted in place once thresholds are
//! exceeded: everything before a safe user-message boundary is replaced
//! by one LLM-produced summary message tagged with an archive id. The
//! append-only audit table is never compacted.
//!
//! Two components:
//!
//! 1. **Policy** (`tracker`) - thresholds, token estimation, boundary
//!    selection
//! 2. **Compactor** (`manager`) - performs the summarization call and the
//!    truncation fallback

mod manager;
mod tracker;

pub use manager::{CompactionOutcome, Compactor};
pub use tracker::{CompactionPolicy, CompactionReason};

/// User turns in the working history before compaction triggers.
pub const DEFAULT_MAX_USER_TURNS: usize = 40;

/// Estimated token count before compaction triggers.
pub const DEFAULT_MAX_ESTIMATED_TOKENS: usize = 100_000;

/// Messages always preserved, unmodified, at the tail.
pub const DEFAULT_PRESERVED_TAIL: usize = 10;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Flat token surcharge per attached image.
pub const IMAGE_TOKEN_SURCHARGE: usize = 1_000;
