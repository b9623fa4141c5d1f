//! Caller-facing evaluation API
//!
//! `InferenceService::evaluate` renders the prompt, opens a
//! [`StreamingBridge`] and exposes the answer as a lazy sequence of text.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::inference::generator::{Generate, GenerationError};
use crate::inference::streaming::{StreamItem, StreamingBridge};
use crate::prompt::{Prompter, ResponseExtractor};
use crate::types::{GenerationRequest, ValidationError};

/// Answers one instruction at a time with a shared generator
pub struct InferenceService<G> {
    generator: Arc<G>,
    prompter: Arc<Prompter>,
    extractor: Arc<dyn ResponseExtractor>,
}

impl<G: Generate> InferenceService<G> {
    /// Renders prompts with `prompter` and extracts answers with it too
    pub fn new(generator: Arc<G>, prompter: Prompter) -> Self {
        let prompter = Arc::new(prompter);
        let extractor: Arc<dyn ResponseExtractor> = prompter.clone();
        Self {
            generator,
            prompter,
            extractor,
        }
    }

    /// Replace the answer extractor, keeping the prompter for rendering
    pub fn with_extractor(mut self, extractor: Arc<dyn ResponseExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn prompter(&self) -> &Prompter {
        &self.prompter
    }

    /// Start answering `request`
    ///
    /// With `stream_output` the sequence yields the growing answer after every
    /// step; without it, exactly one item with the final answer. Dropping the
    /// returned stream early cancels generation and joins the worker.
    pub fn evaluate(&self, request: GenerationRequest) -> Result<AnswerStream, ValidationError> {
        request.validate()?;

        let prompt = self.prompter.generate_prompt(request.instruction(), None);
        let streaming = request.stream_output();
        let bridge = StreamingBridge::open(request, prompt, Arc::clone(&self.generator))?;

        tracing::info!(bridge = %bridge.id(), streaming, "Evaluating instruction");

        Ok(AnswerStream {
            bridge,
            extractor: Arc::clone(&self.extractor),
            streaming,
            finished: false,
        })
    }
}

/// Lazy sequence of answer text for one request
pub struct AnswerStream {
    bridge: StreamingBridge,
    extractor: Arc<dyn ResponseExtractor>,
    streaming: bool,
    finished: bool,
}

impl AnswerStream {
    pub fn id(&self) -> Uuid {
        self.bridge.id()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Stop generation and join the worker
    pub fn close(&mut self) {
        self.finished = true;
        self.bridge.close();
    }

    /// Feed the answers into a tokio channel from a blocking task
    ///
    /// Must be called inside a tokio runtime. Dropping the receiver stops the
    /// pump at its next send, which closes the bridge.
    pub fn into_channel(self, capacity: usize) -> mpsc::Receiver<Result<String, GenerationError>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut stream = self;
        let id = stream.id();

        tokio::task::spawn_blocking(move || {
            for item in &mut stream {
                if tx.blocking_send(item).is_err() {
                    tracing::debug!(bridge = %id, "Answer receiver dropped");
                    break;
                }
            }
            stream.close();
        });

        rx
    }

    fn pull(&mut self) -> Option<StreamItem> {
        match self.bridge.next() {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(bridge = %self.bridge.id(), "Stream pulled after end: {}", e);
                self.finished = true;
                None
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.bridge.close();
    }

    fn next_streaming(&mut self) -> Option<Result<String, GenerationError>> {
        match self.pull()? {
            StreamItem::Partial(text) => Some(Ok(self.extractor.extract(&text))),
            StreamItem::Done => {
                self.finish();
                None
            }
            StreamItem::Failed(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }

    fn next_collected(&mut self) -> Option<Result<String, GenerationError>> {
        let mut last = None;
        loop {
            match self.pull()? {
                StreamItem::Partial(text) => last = Some(text),
                StreamItem::Done => {
                    self.finish();
                    let decoded = last.unwrap_or_default();
                    tracing::debug!("Decoded output: {}", decoded);
                    return Some(Ok(self.extractor.extract(&decoded)));
                }
                StreamItem::Failed(e) => {
                    self.finish();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Iterator for AnswerStream {
    type Item = Result<String, GenerationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.streaming {
            self.next_streaming()
        } else {
            self.next_collected()
        }
    }
}

impl std::fmt::Debug for AnswerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerStream")
            .field("bridge", &self.bridge)
            .field("streaming", &self.streaming)
            .field("finished", &self.finished)
            .finish()
    }
}
