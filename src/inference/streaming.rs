//! Streaming inference support
//!
//! Turns one blocking, callback-instrumented generation call into a pull-based,
//! cancellable sequence of [`StreamItem`]s.
//!
//! # Architecture
//!
//! Every [`StreamingBridge`] owns exactly one worker thread that runs the
//! generation call. The worker hands snapshots to the caller through a
//! depth-1 `sync_channel`, so it never gets more than one step ahead of a slow
//! consumer. The caller pulls with [`StreamingBridge::next`] and tears down
//! with [`StreamingBridge::close`], which `Drop` also runs, so the worker is
//! joined on every exit path including unwinding.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use uuid::Uuid;

use crate::inference::generator::{Generate, GenerationError, StepControl};
use crate::inference::stopping::StoppingSignal;
use crate::types::{GenerationRequest, ValidationError};

/// An item emitted by a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Full cumulative decoded text so far
    Partial(String),
    /// Generation completed successfully
    Done,
    /// Generation failed
    Failed(GenerationError),
}

impl StreamItem {
    /// Returns true if this is a snapshot
    pub fn is_partial(&self) -> bool {
        matches!(self, StreamItem::Partial(_))
    }

    /// Returns true for `Done` and `Failed`
    pub fn is_terminal(&self) -> bool {
        !self.is_partial()
    }

    /// Extracts the snapshot text if this is a Partial variant
    pub fn as_partial(&self) -> Option<&str> {
        match self {
            StreamItem::Partial(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error if this is a Failed variant
    pub fn as_error(&self) -> Option<&GenerationError> {
        match self {
            StreamItem::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Misuse of the pull contract
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocolError {
    #[error("stream already delivered its terminal item")]
    Terminated,

    #[error("stream is closed")]
    Closed,
}

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Worker started, terminal item not yet delivered
    Running,
    /// `Done` was delivered
    Completed,
    /// `Failed` was delivered
    Failed,
    /// Closed before the terminal item was delivered
    Cancelled,
    /// Worker joined, resources released
    Closed,
}

/// Single-use adapter from a blocking generation call to a pull-based stream
pub struct StreamingBridge {
    id: Uuid,
    receiver: Option<Receiver<StreamItem>>,
    signal: StoppingSignal,
    worker: Option<JoinHandle<()>>,
    state: BridgeState,
}

impl StreamingBridge {
    /// Validates `request` and starts the worker running `generator`
    ///
    /// Returns as soon as the worker is spawned. No worker is started when
    /// validation fails.
    pub fn open<G: Generate>(
        request: GenerationRequest,
        prompt: impl Into<String>,
        generator: G,
    ) -> Result<Self, ValidationError> {
        request.validate()?;

        let id = Uuid::new_v4();
        let prompt = prompt.into();
        let signal = StoppingSignal::new(generator.eos_token_ids());
        let (tx, rx) = mpsc::sync_channel::<StreamItem>(1);

        let worker_signal = signal.clone();
        let worker_tx = tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("generation-{}", id))
            .spawn(move || run_worker(id, generator, request, prompt, worker_tx, worker_signal));

        let worker = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(bridge = %id, "Failed to spawn generation worker: {}", e);
                // The channel is empty, so this cannot block.
                let _ = tx.try_send(StreamItem::Failed(GenerationError::WorkerError(
                    e.to_string(),
                )));
                None
            }
        };

        tracing::debug!(bridge = %id, "Stream opened");

        Ok(Self {
            id,
            receiver: Some(rx),
            signal,
            worker,
            state: BridgeState::Running,
        })
    }

    /// Blocks until the next item is available
    ///
    /// Calling this after the terminal item was returned, or after `close()`,
    /// is a contract violation.
    pub fn next(&mut self) -> Result<StreamItem, StreamProtocolError> {
        match self.state {
            BridgeState::Running => {}
            BridgeState::Cancelled | BridgeState::Closed => {
                return Err(StreamProtocolError::Closed)
            }
            BridgeState::Completed | BridgeState::Failed => {
                return Err(StreamProtocolError::Terminated)
            }
        }

        let receiver = self.receiver.as_ref().ok_or(StreamProtocolError::Closed)?;

        // The worker always sends a terminal item, so a disconnect means it died
        // outside the guarded generation call.
        let item = receiver.recv().unwrap_or_else(|_| {
            StreamItem::Failed(GenerationError::WorkerError(
                "worker exited without a terminal item".to_string(),
            ))
        });

        match &item {
            StreamItem::Partial(_) => {}
            StreamItem::Done => {
                self.state = BridgeState::Completed;
                self.reap();
                tracing::debug!(bridge = %self.id, "Stream completed");
            }
            StreamItem::Failed(e) => {
                self.state = BridgeState::Failed;
                self.reap();
                tracing::debug!(bridge = %self.id, "Stream failed: {}", e);
            }
        }

        Ok(item)
    }

    /// Cancels a running worker, waits for it to exit and releases the channel
    ///
    /// Idempotent. Blocks for at most one token's compute time when the
    /// generator honors the stopping contract.
    pub fn close(&mut self) {
        if self.state == BridgeState::Closed {
            return;
        }

        if self.state == BridgeState::Running {
            self.signal.cancel();
            self.state = BridgeState::Cancelled;
            tracing::debug!(bridge = %self.id, "Stream cancelled by consumer");
        }

        // Dropping the receiver unblocks a worker parked on a full channel.
        self.receiver = None;
        self.reap();
        self.state = BridgeState::Closed;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// True while a worker handle is still owned (not yet joined)
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// True once the consumer cancelled generation
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    fn reap(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!(
                    bridge = %self.id,
                    "Generation worker panicked outside the generator"
                );
            }
        }
    }
}

impl Drop for StreamingBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingBridge")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("has_worker", &self.worker.is_some())
            .finish()
    }
}

/// Worker thread body
///
/// Pushes one `Partial` per step, then exactly one terminal item.
fn run_worker<G: Generate>(
    id: Uuid,
    generator: G,
    request: GenerationRequest,
    prompt: String,
    tx: SyncSender<StreamItem>,
    signal: StoppingSignal,
) {
    tracing::debug!(bridge = %id, "Generation worker started");
    let mut steps = 0usize;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut on_step = |text: &str| -> StepControl {
            // Blocking send: the backpressure point.
            if tx.send(StreamItem::Partial(text.to_string())).is_err() {
                return StepControl::Stop;
            }
            steps += 1;
            if signal.is_cancelled() {
                StepControl::Stop
            } else {
                StepControl::Continue
            }
        };
        generator.generate(&request, &prompt, &mut on_step, &signal)
    }));

    let terminal = match outcome {
        Ok(Ok(())) => StreamItem::Done,
        Ok(Err(e)) => StreamItem::Failed(e),
        Err(payload) => StreamItem::Failed(GenerationError::WorkerPanicked(panic_message(
            payload.as_ref(),
        ))),
    };

    match (&terminal, signal.is_cancelled()) {
        (StreamItem::Failed(e), true) => {
            tracing::debug!(bridge = %id, "Generation ended with error after cancellation: {}", e);
        }
        (StreamItem::Failed(e), false) => {
            tracing::error!(bridge = %id, "Generation failed after {} steps: {}", steps, e);
        }
        _ => {
            tracing::debug!(bridge = %id, "Generation finished after {} steps", steps);
        }
    }

    if tx.send(terminal).is_err() {
        tracing::debug!(bridge = %id, "Consumer gone before terminal item");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{EndlessGenerator, ScriptedGenerator};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn request() -> GenerationRequest {
        GenerationRequest::new("What is the capital of France?").unwrap()
    }

    fn drain(bridge: &mut StreamingBridge) -> Vec<StreamItem> {
        let mut items = Vec::new();
        loop {
            let item = bridge.next().expect("stream ended early");
            let terminal = item.is_terminal();
            items.push(item);
            if terminal {
                return items;
            }
        }
    }

    #[test]
    fn test_stream_item_variants() {
        let partial = StreamItem::Partial("The".to_string());
        assert!(partial.is_partial());
        assert!(!partial.is_terminal());
        assert_eq!(partial.as_partial(), Some("The"));

        assert!(StreamItem::Done.is_terminal());

        let failed = StreamItem::Failed(GenerationError::NoModelLoaded);
        assert!(failed.is_terminal());
        assert_eq!(failed.as_error(), Some(&GenerationError::NoModelLoaded));
    }

    #[test]
    fn test_items_in_order_then_done() {
        let generator = ScriptedGenerator::new(["The", "The capital", "The capital is Paris"]);
        let mut bridge = StreamingBridge::open(request(), "prompt", generator).unwrap();

        let items = drain(&mut bridge);
        assert_eq!(
            items,
            vec![
                StreamItem::Partial("The".to_string()),
                StreamItem::Partial("The capital".to_string()),
                StreamItem::Partial("The capital is Paris".to_string()),
                StreamItem::Done,
            ]
        );
        assert_eq!(bridge.state(), BridgeState::Completed);
        assert!(!bridge.has_worker());
    }

    #[test]
    fn test_next_after_terminal_is_protocol_error() {
        let generator = ScriptedGenerator::new(["a"]);
        let mut bridge = StreamingBridge::open(request(), "p", generator).unwrap();
        drain(&mut bridge);
        assert_eq!(bridge.next(), Err(StreamProtocolError::Terminated));

        bridge.close();
        assert_eq!(bridge.next(), Err(StreamProtocolError::Closed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let generator = ScriptedGenerator::new(["a"]);
        let mut bridge = StreamingBridge::open(request(), "p", generator).unwrap();
        bridge.close();
        bridge.close();
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert!(!bridge.has_worker());
    }

    #[test]
    fn test_invalid_request_starts_no_worker() {
        let generator = Arc::new(ScriptedGenerator::new(["a"]));
        let request = serde_json::from_str::<GenerationRequest>(
            r#"{"instruction": "q", "temperature": -0.1}"#,
        )
        .unwrap();

        let err = StreamingBridge::open(request, "p", generator.clone()).unwrap_err();
        assert_eq!(err.field, "temperature");
        assert_eq!(generator.started(), 0);
    }

    #[test]
    fn test_abandon_after_first_item_joins_worker() {
        let generator = Arc::new(EndlessGenerator::new(Duration::from_millis(5)));
        let mut bridge = StreamingBridge::open(request(), "p", generator.clone()).unwrap();

        let first = bridge.next().unwrap();
        assert!(first.is_partial());

        let started = Instant::now();
        bridge.close();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!bridge.has_worker());
        assert!(!generator.is_running());
        assert!(bridge.is_cancelled());
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[test]
    fn test_drop_joins_worker() {
        let generator = Arc::new(EndlessGenerator::new(Duration::from_millis(1)));
        {
            let mut bridge = StreamingBridge::open(request(), "p", generator.clone()).unwrap();
            bridge.next().unwrap();
        }
        assert!(!generator.is_running());
    }

    #[test]
    fn test_close_unblocks_worker_parked_on_full_channel() {
        // Fast generator: the channel fills before the consumer reads anything.
        let generator = Arc::new(EndlessGenerator::new(Duration::ZERO));
        let mut bridge = StreamingBridge::open(request(), "p", generator.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        bridge.close();
        assert!(!generator.is_running());
    }

    #[test]
    fn test_backpressure_bounds_worker_lead() {
        let generator = Arc::new(EndlessGenerator::new(Duration::ZERO));
        let mut bridge = StreamingBridge::open(request(), "p", generator.clone()).unwrap();
        bridge.next().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // One item consumed, one buffered, one parked in a blocking send.
        assert!(generator.emitted() <= 3);
        bridge.close();
    }

    #[test]
    fn test_failure_midway_yields_single_failed() {
        let generator = ScriptedGenerator::new(["The", "The capital", "never"]).failing_at(2);
        let mut bridge = StreamingBridge::open(request(), "p", generator).unwrap();

        let items = drain(&mut bridge);
        assert_eq!(items.len(), 3);
        assert!(items[0].is_partial());
        assert!(items[1].is_partial());
        assert!(matches!(
            items[2],
            StreamItem::Failed(GenerationError::Inference(_))
        ));
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert_eq!(bridge.next(), Err(StreamProtocolError::Terminated));
    }

    #[test]
    fn test_failure_before_first_step() {
        let generator = ScriptedGenerator::new(["unused"]).failing_at(0);
        let mut bridge = StreamingBridge::open(request(), "p", generator).unwrap();
        let items = drain(&mut bridge);
        assert_eq!(items.len(), 1);
        assert!(items[0].as_error().is_some());
    }

    #[test]
    fn test_panic_in_generator_becomes_failed() {
        let generator = ScriptedGenerator::new(["a", "ab"]).panicking_at(1);
        let mut bridge = StreamingBridge::open(request(), "p", generator).unwrap();
        let items = drain(&mut bridge);
        assert_eq!(items[0], StreamItem::Partial("a".to_string()));
        assert!(matches!(
            items[1],
            StreamItem::Failed(GenerationError::WorkerPanicked(_))
        ));
        assert!(!bridge.has_worker());
    }

    #[test]
    fn test_eos_token_ends_stream() {
        let generator = ScriptedGenerator::new(["a", "ab", "abc"]).with_eos([101]);
        let mut bridge = StreamingBridge::open(request(), "p", generator).unwrap();
        let items = drain(&mut bridge);
        assert_eq!(items, vec![StreamItem::Partial("a".to_string()), StreamItem::Done]);
    }

    #[test]
    fn test_concurrent_bridges_are_independent() {
        let mut first =
            StreamingBridge::open(request(), "p", Arc::new(EndlessGenerator::new(Duration::ZERO)))
                .unwrap();
        let mut second =
            StreamingBridge::open(request(), "p", ScriptedGenerator::new(["x", "xy"])).unwrap();

        first.next().unwrap();
        first.close();

        let items = drain(&mut second);
        assert_eq!(items.last(), Some(&StreamItem::Done));
        assert!(!second.is_cancelled());
        assert_ne!(first.id(), second.id());
    }
}
