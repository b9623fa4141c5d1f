//! Per-token stopping check
//!
//! A `StoppingSignal` is created fresh for every stream and tells the
//! generation loop when to halt: either the model produced an end-of-sequence
//! token, or the consumer cancelled. Cancellation is cooperative, so its
//! latency is bounded by one token's compute time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Token id as used by the tokenizer
pub type TokenId = i32;

#[derive(Debug)]
struct SignalState {
    cancelled: AtomicBool,
    eos_tokens: HashSet<TokenId>,
}

/// Shared cancellation flag plus the end-of-sequence token set
///
/// Clones share the same flag. Never hand one signal to two streams.
#[derive(Debug, Clone)]
pub struct StoppingSignal {
    state: Arc<SignalState>,
}

impl StoppingSignal {
    /// Create a signal with the tokenizer's end-of-sequence ids
    pub fn new(eos_tokens: impl IntoIterator<Item = TokenId>) -> Self {
        Self {
            state: Arc::new(SignalState {
                cancelled: AtomicBool::new(false),
                eos_tokens: eos_tokens.into_iter().collect(),
            }),
        }
    }

    /// Request that generation stops at the next token boundary
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn is_eos(&self, token: TokenId) -> bool {
        self.state.eos_tokens.contains(&token)
    }

    /// Evaluated once per generated token on the generating thread
    pub fn should_stop(&self, last_token: TokenId) -> bool {
        self.is_eos(last_token) || self.is_cancelled()
    }

    pub fn eos_tokens(&self) -> &HashSet<TokenId> {
        &self.state.eos_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_eos_stops() {
        let signal = StoppingSignal::new([2]);
        assert!(signal.should_stop(2));
        assert!(!signal.should_stop(17));
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_cancel_stops_any_token() {
        let signal = StoppingSignal::new([2]);
        signal.cancel();
        assert!(signal.should_stop(17));
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_cancel_visible_across_threads() {
        let signal = StoppingSignal::new(Vec::new());
        let remote = signal.clone();
        thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(signal.should_stop(0));
    }

    #[test]
    fn test_signals_are_independent() {
        let first = StoppingSignal::new([2]);
        let second = StoppingSignal::new([2]);
        first.cancel();
        assert!(!second.is_cancelled());
        assert_eq!(second.eos_tokens().len(), 1);
    }
}
