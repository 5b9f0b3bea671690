//! Cooperative cancellation.
//!
//! An [`AbortSignal`] is a cheap clonable flag threaded through every VLM
//! call and checked at each suspension point. Raising it never interrupts a
//! task mid-instruction; each worker notices the flag at its next check and
//! unwinds with [`HanjadocError::Aborted`], releasing scoped resources
//! (scratch directories, subprocess handles) on the way out.

use crate::error::{HanjadocError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared cancellation flag.
///
/// Cloning is cheap (an `Arc` bump); all clones observe the same flag.
/// The default signal is never aborted, so APIs can take an `AbortSignal`
/// unconditionally and callers that do not care pass `AbortSignal::new()`.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    /// Create a fresh, un-raised signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been raised.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Aborted)` if the signal has been raised.
    ///
    /// Call this before every suspension point that should be cancellable.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(HanjadocError::Aborted)
        } else {
            Ok(())
        }
    }
}
