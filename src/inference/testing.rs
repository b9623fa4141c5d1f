//! Deterministic generators for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::inference::generator::{Generate, GenerationError, StepControl};
use crate::inference::stopping::{StoppingSignal, TokenId};
use crate::types::GenerationRequest;

/// Emits a fixed list of cumulative snapshots
///
/// Step `i` is treated as token id `100 + i`, so EOS handling can be tested
/// through [`ScriptedGenerator::with_eos`].
pub(crate) struct ScriptedGenerator {
    steps: Vec<String>,
    eos: Vec<TokenId>,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    echo_prompt: bool,
    started: AtomicUsize,
}

impl ScriptedGenerator {
    pub(crate) fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
            eos: Vec::new(),
            fail_at: None,
            panic_at: None,
            echo_prompt: false,
            started: AtomicUsize::new(0),
        }
    }

    /// Return an error instead of emitting step `index`
    pub(crate) fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Panic instead of emitting step `index`
    pub(crate) fn panicking_at(mut self, index: usize) -> Self {
        self.panic_at = Some(index);
        self
    }

    pub(crate) fn with_eos(mut self, eos: impl IntoIterator<Item = TokenId>) -> Self {
        self.eos = eos.into_iter().collect();
        self
    }

    /// Prefix every snapshot with the prompt, like a decoder re-decoding the full sequence
    pub(crate) fn echoing_prompt(mut self) -> Self {
        self.echo_prompt = true;
        self
    }

    /// Number of times `generate` was invoked
    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl Generate for ScriptedGenerator {
    fn eos_token_ids(&self) -> Vec<TokenId> {
        self.eos.clone()
    }

    fn generate(
        &self,
        _request: &GenerationRequest,
        prompt: &str,
        on_step: &mut dyn FnMut(&str) -> StepControl,
        signal: &StoppingSignal,
    ) -> Result<(), GenerationError> {
        self.started.fetch_add(1, Ordering::SeqCst);

        for (index, step) in self.steps.iter().enumerate() {
            if self.fail_at == Some(index) {
                return Err(GenerationError::Inference("scripted failure".to_string()));
            }
            if self.panic_at == Some(index) {
                panic!("scripted panic");
            }
            if signal.should_stop(100 + index as TokenId) {
                break;
            }
            let snapshot = if self.echo_prompt {
                format!("{}{}", prompt, step)
            } else {
                step.clone()
            };
            if on_step(&snapshot).is_stop() {
                break;
            }
        }

        Ok(())
    }
}

/// Emits a growing snapshot until told to stop
pub(crate) struct EndlessGenerator {
    step_delay: Duration,
    running: AtomicBool,
    emitted: AtomicUsize,
}

impl EndlessGenerator {
    pub(crate) fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            running: AtomicBool::new(false),
            emitted: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshots accepted by the stream so far
    pub(crate) fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

impl Generate for EndlessGenerator {
    fn eos_token_ids(&self) -> Vec<TokenId> {
        vec![2]
    }

    fn generate(
        &self,
        _request: &GenerationRequest,
        _prompt: &str,
        on_step: &mut dyn FnMut(&str) -> StepControl,
        signal: &StoppingSignal,
    ) -> Result<(), GenerationError> {
        self.running.store(true, Ordering::SeqCst);
        let mut text = String::new();

        for _ in 0..1_000_000 {
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
            if signal.should_stop(7) {
                break;
            }
            text.push_str(" tok");
            if on_step(&text).is_stop() {
                break;
            }
            self.emitted.fetch_add(1, Ordering::SeqCst);
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
