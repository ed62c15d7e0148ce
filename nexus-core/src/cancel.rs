//! Cooperative cancellation. Not preemptive: callers must check
//! `raise_if_cancelled()` between chunks.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("request was cancelled")]
pub struct Cancelled;

/// A small, cheaply clonable flag shared between a `send` in flight and a
/// concurrent `cancel` call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn raise_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let t = CancellationToken::new();
        assert!(!t.is_cancelled());
        assert!(t.raise_if_cancelled().is_ok());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let t = CancellationToken::new();
        let clone = t.clone();
        clone.cancel();
        assert!(t.is_cancelled());
        assert!(t.raise_if_cancelled().is_err());
    }
}
