//! Cooperative stop signaling shared across a generation run.
//!
//! Two signals of this shape exist per run: a cancellation flag (user
//! aborted the run) and an input flag (new user input arrived mid-run).
//! Raising a signal never interrupts in-flight work; loops observe it
//! after each unit of work — a tool call, a state transition — and wind
//! down cleanly, keeping partial results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cheap clonable flag checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lower the signal so the next unit of work starts clean.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}
