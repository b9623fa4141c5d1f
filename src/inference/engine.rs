//! Inference engine implementation
//!
//! Runs generation on llama-cpp and exposes it through [`Generate`].
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, all llama-cpp operations run on one
//! dedicated model thread. A [`StreamingBridge`](crate::inference::StreamingBridge)
//! worker calling [`LlamaEngine::generate`] forwards the job to that thread and
//! replays every snapshot into its own `on_step` callback, so the callback runs
//! on the bridge worker as the [`Generate`] contract requires. The single model
//! thread also serializes concurrent requests against the one loaded model.

use std::num::NonZeroU32;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaLoraAdapter, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::generator::{Generate, GenerationError, StepControl};
use crate::inference::model::validate_gguf;
use crate::inference::stopping::{StoppingSignal, TokenId};
use crate::types::{Device, GenerationRequest};

/// Smallest context window handed to llama.cpp
const MIN_CONTEXT_SIZE: u32 = 2048;

/// Tokens decoded per `ctx.decode` call; also the context's `n_batch`
const BATCH_SIZE: usize = 512;

/// How often a caller waiting on the model thread re-checks cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Sampling parameters derived from a request
#[derive(Debug, Clone)]
struct SamplingParams {
    max_new_tokens: u32,
    temperature: f32,
    /// 0 = disabled
    top_k: u32,
    top_p: f32,
    /// None = random
    seed: Option<u32>,
}

impl From<&GenerationRequest> for SamplingParams {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            max_new_tokens: request.max_new_tokens(),
            temperature: request.temperature(),
            top_k: request.top_k(),
            top_p: request.top_p(),
            seed: request.seed(),
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
    /// End-of-sequence token id
    pub eos_token: TokenId,
    /// Device the model was loaded on
    pub device: String,
}

/// A LoRA adapter applied on top of the base model
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    pub path: String,
    pub scale: f32,
}

/// Messages from the model thread back to a generating caller
enum EngineEvent {
    Step(String),
    Finished(Result<(), GenerationError>),
}

/// Commands sent to the model thread
enum WorkerCommand {
    Init {
        response_tx: Sender<Result<(), GenerationError>>,
    },
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        context_size: u32,
        device: String,
        response_tx: Sender<Result<LoadedModelInfo, GenerationError>>,
    },
    LoadAdapter {
        path: PathBuf,
        scale: f32,
        response_tx: Sender<Result<AdapterInfo, GenerationError>>,
    },
    UnloadModel,
    Generate {
        prompt: String,
        params: SamplingParams,
        signal: StoppingSignal,
        event_tx: SyncSender<EngineEvent>,
    },
    Shutdown,
}

/// The LLM inference engine using llama-cpp-2
///
/// Uses a dedicated model thread for all llama-cpp operations since
/// the underlying types are not Send.
pub struct LlamaEngine {
    /// Channel to send commands to the model thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the model thread
    worker_handle: Option<JoinHandle<()>>,
    /// Cached model info (updated after load)
    model_info: Option<LoadedModelInfo>,
    /// Adapter applied to every generation, if any
    adapter: Option<AdapterInfo>,
    /// Whether backend is initialized
    initialized: bool,
}

impl LlamaEngine {
    /// Creates a new uninitialized engine
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            model_info: None,
            adapter: None,
            initialized: false,
        }
    }

    /// Initializes the llama.cpp backend
    ///
    /// Must be called before loading models or running inference.
    /// Spawns the dedicated model thread.
    pub fn init(&mut self) -> Result<(), GenerationError> {
        if self.initialized {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let handle = thread::Builder::new()
            .name("llama-model".to_string())
            .spawn(move || model_thread_main(command_rx))
            .map_err(|e| GenerationError::WorkerError(e.to_string()))?;

        self.command_tx = Some(command_tx.clone());
        self.worker_handle = Some(handle);

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Init { response_tx })
            .map_err(|e| GenerationError::WorkerError(e.to_string()))?;
        response_rx
            .recv()
            .map_err(|e| GenerationError::WorkerError(e.to_string()))??;

        self.initialized = true;
        tracing::info!("LlamaEngine model thread started");
        Ok(())
    }

    /// Loads a GGUF model from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the GGUF model file
    /// * `device` - Device resolved at startup; decides how many layers are offloaded
    /// * `context_size` - Upper bound for the context window of each generation
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        device: &Device,
        context_size: u32,
    ) -> Result<LoadedModelInfo, GenerationError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(GenerationError::BackendNotInitialized)?;

        let path = path.as_ref();

        // Validate GGUF file first (on the calling thread, just file I/O)
        let header = validate_gguf(path)?;
        tracing::debug!("GGUF v{} validation passed for {:?}", header.version, path);

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                gpu_layers: device.gpu_layers(),
                context_size,
                device: device.to_string(),
                response_tx,
            })
            .map_err(|e| GenerationError::WorkerError(e.to_string()))?;

        let result = response_rx
            .recv()
            .map_err(|e| GenerationError::WorkerError(e.to_string()))??;

        self.model_info = Some(result.clone());
        self.adapter = None;

        Ok(result)
    }

    /// Loads optional LoRA adapter weights on top of the current model
    ///
    /// A missing adapter file is not an error: the engine keeps serving the
    /// base model and returns `Ok(None)` after logging a warning. Any other
    /// failure (unreadable file, incompatible adapter) is returned.
    pub fn load_adapter<P: AsRef<Path>>(
        &mut self,
        path: P,
        scale: f32,
    ) -> Result<Option<AdapterInfo>, GenerationError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(
                "LoRA weights not found at {:?}, running the base model without adapter",
                path
            );
            return Ok(None);
        }
        if !path.is_file() {
            return Err(GenerationError::AdapterLoad(format!(
                "{} is not a GGUF adapter file",
                path.display()
            )));
        }

        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(GenerationError::BackendNotInitialized)?;
        if self.model_info.is_none() {
            return Err(GenerationError::NoModelLoaded);
        }

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::LoadAdapter {
                path: path.to_path_buf(),
                scale,
                response_tx,
            })
            .map_err(|e| GenerationError::WorkerError(e.to_string()))?;

        let info = response_rx
            .recv()
            .map_err(|e| GenerationError::WorkerError(e.to_string()))??;

        self.adapter = Some(info.clone());
        Ok(Some(info))
    }

    /// Unloads the current model and frees VRAM
    pub fn unload_model(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::UnloadModel);
        }
        self.model_info = None;
        self.adapter = None;
        tracing::info!("Model unload requested");
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    pub fn adapter(&self) -> Option<&AdapterInfo> {
        self.adapter.as_ref()
    }

    /// Returns true if a model is currently loaded
    pub fn is_model_loaded(&self) -> bool {
        self.model_info.is_some()
    }

    /// Returns true if the backend is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for model thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Generate for LlamaEngine {
    fn eos_token_ids(&self) -> Vec<TokenId> {
        self.model_info
            .as_ref()
            .map(|info| vec![info.eos_token])
            .unwrap_or_default()
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        prompt: &str,
        on_step: &mut dyn FnMut(&str) -> StepControl,
        signal: &StoppingSignal,
    ) -> Result<(), GenerationError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(GenerationError::BackendNotInitialized)?;

        if self.model_info.is_none() {
            return Err(GenerationError::NoModelLoaded);
        }

        if request.num_beams() > 1 {
            tracing::debug!(
                "{} beams requested; llama.cpp sampling runs a single sequence",
                request.num_beams()
            );
        }

        let (event_tx, event_rx) = mpsc::sync_channel(1);
        command_tx
            .send(WorkerCommand::Generate {
                prompt: prompt.to_string(),
                params: SamplingParams::from(request),
                signal: signal.clone(),
                event_tx,
            })
            .map_err(|e| GenerationError::WorkerError(e.to_string()))?;

        relay_events(&event_rx, on_step, signal)
    }
}

/// Replays model thread events into `on_step` until the job finishes
///
/// The job may sit in the model thread's queue behind another generation, so
/// the wait polls `signal` and gives up as soon as the consumer cancelled.
/// Returning drops `event_rx`, which stops the model thread at its next send.
fn relay_events(
    event_rx: &Receiver<EngineEvent>,
    on_step: &mut dyn FnMut(&str) -> StepControl,
    signal: &StoppingSignal,
) -> Result<(), GenerationError> {
    loop {
        match event_rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(EngineEvent::Step(text)) => {
                if on_step(&text).is_stop() {
                    return Ok(());
                }
            }
            Ok(EngineEvent::Finished(result)) => return result,
            Err(RecvTimeoutError::Timeout) => {
                if signal.is_cancelled() {
                    tracing::debug!("Generation cancelled while waiting on the model thread");
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(GenerationError::WorkerError(
                    "model thread exited during generation".to_string(),
                ))
            }
        }
    }
}

/// Model thread main loop
///
/// Owns the LlamaBackend, LlamaModel and adapter, processes commands in order.
fn model_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;
    let mut model: Option<LlamaModel> = None;
    // Declared after the model so it is dropped first.
    let mut adapter: Option<(LlamaLoraAdapter, f32)> = None;
    let mut context_limit = MIN_CONTEXT_SIZE;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Init { response_tx }) => {
                let result = match LlamaBackend::init() {
                    Ok(b) => {
                        backend = Some(b);
                        tracing::info!("LlamaBackend initialized in model thread");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Failed to init backend: {}", e);
                        Err(GenerationError::BackendInit(e.to_string()))
                    }
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::LoadModel {
                path,
                gpu_layers,
                context_size,
                device,
                response_tx,
            }) => {
                adapter = None;
                let result = match backend.as_ref() {
                    Some(b) => load_model_internal(b, &path, gpu_layers, &device),
                    None => Err(GenerationError::BackendNotInitialized),
                };
                let reply = result.map(|(loaded, info)| {
                    model = Some(loaded);
                    context_limit = context_size.max(MIN_CONTEXT_SIZE);
                    info
                });
                let _ = response_tx.send(reply);
            }
            Ok(WorkerCommand::LoadAdapter {
                path,
                scale,
                response_tx,
            }) => {
                let result = match model.as_ref() {
                    Some(m) => m
                        .lora_adapter_init(&path)
                        .map(|loaded| {
                            adapter = Some((loaded, scale));
                            tracing::info!("LoRA adapter loaded: {:?} (scale {})", path, scale);
                            AdapterInfo {
                                path: path.to_string_lossy().to_string(),
                                scale,
                            }
                        })
                        .map_err(|e| GenerationError::AdapterLoad(e.to_string())),
                    None => Err(GenerationError::NoModelLoaded),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::UnloadModel) => {
                adapter = None;
                model = None;
                tracing::info!("Model unloaded in model thread");
            }
            Ok(WorkerCommand::Generate {
                prompt,
                params,
                signal,
                event_tx,
            }) => {
                if signal.is_cancelled() {
                    tracing::debug!("Skipping generation cancelled while queued");
                    let _ = event_tx.send(EngineEvent::Finished(Ok(())));
                    continue;
                }
                let result = match (&backend, &model) {
                    (Some(b), Some(m)) => run_generation(
                        b,
                        m,
                        adapter.as_mut(),
                        context_limit,
                        &prompt,
                        &params,
                        &signal,
                        &event_tx,
                    ),
                    _ => Err(GenerationError::NoModelLoaded),
                };
                let _ = event_tx.send(EngineEvent::Finished(result));
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Model thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, model thread exiting");
                break;
            }
        }
    }
}

/// Load model and extract info (helper for the model thread)
fn load_model_internal(
    backend: &LlamaBackend,
    path: &Path,
    gpu_layers: u32,
    device: &str,
) -> Result<(LlamaModel, LoadedModelInfo), GenerationError> {
    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| GenerationError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
        eos_token: model.token_eos().0,
        device: device.to_string(),
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx, eos {}, on {})",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length,
        info.eos_token,
        info.device
    );

    Ok((model, info))
}

/// Run text generation (called from the model thread)
#[allow(clippy::too_many_arguments)]
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    adapter: Option<&mut (LlamaLoraAdapter, f32)>,
    context_limit: u32,
    prompt: &str,
    params: &SamplingParams,
    signal: &StoppingSignal,
    tx: &SyncSender<EngineEvent>,
) -> Result<(), GenerationError> {
    let n_ctx = context_limit.min(model.n_ctx_train()).max(MIN_CONTEXT_SIZE);
    let n_ctx = NonZeroU32::new(n_ctx)
        .ok_or_else(|| GenerationError::ContextCreate("context size is zero".to_string()))?;

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(BATCH_SIZE as u32);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| GenerationError::ContextCreate(e.to_string()))?;

    if let Some((lora, scale)) = adapter {
        ctx.lora_adapter_set(lora, *scale)
            .map_err(|e| GenerationError::AdapterLoad(e.to_string()))?;
    }

    let tokens = model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| GenerationError::Tokenization(e.to_string()))?;

    let needed = tokens.len() as u64 + params.max_new_tokens as u64;
    if needed > n_ctx.get() as u64 {
        return Err(GenerationError::Tokenization(format!(
            "prompt of {} tokens plus {} new tokens exceeds the {} token context",
            tokens.len(),
            params.max_new_tokens,
            n_ctx
        )));
    }

    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    run_inference(&mut ctx, model, tokens, prompt, params, signal, tx)
}

fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    // Use greedy sampling for very low temperature
    if params.temperature < 0.01 {
        return LlamaSampler::greedy();
    }

    let seed = params.seed.unwrap_or_else(rand_seed);

    let mut chain = Vec::with_capacity(4);
    if params.top_k > 0 {
        chain.push(LlamaSampler::top_k(params.top_k as i32));
    }
    chain.push(LlamaSampler::top_p(params.top_p, 1));
    chain.push(LlamaSampler::temp(params.temperature));
    chain.push(LlamaSampler::dist(seed));
    LlamaSampler::chain_simple(chain)
}

/// Runs the inference loop
///
/// Every step re-decodes the whole generated sequence and sends the prompt
/// plus that text, so each snapshot is self-contained.
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<LlamaToken>,
    prompt: &str,
    params: &SamplingParams,
    signal: &StoppingSignal,
    tx: &SyncSender<EngineEvent>,
) -> Result<(), GenerationError> {
    if prompt_tokens.is_empty() {
        return Err(GenerationError::Tokenization("prompt produced no tokens".to_string()));
    }

    let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
    let last_index = prompt_tokens.len() - 1;

    // Logits are only needed for the final prompt token, which lands in the
    // last chunk, so `batch` is left holding it for the first sample.
    for chunk in batch_plan(prompt_tokens.len(), BATCH_SIZE) {
        batch.clear();
        for i in chunk {
            batch
                .add(prompt_tokens[i], i as i32, &[0], i == last_index)
                .map_err(|e| {
                    GenerationError::Inference(format!("Failed to add token to batch: {}", e))
                })?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| GenerationError::Inference(format!("Failed to decode prompt: {}", e)))?;
    }

    let mut sampler = build_sampler(params);
    let mut n_decoded = prompt_tokens.len() as i32;
    let mut generated: Vec<u8> = Vec::new();

    for _ in 0..params.max_new_tokens {
        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if signal.should_stop(new_token.0) || model.is_eog_token(new_token) {
            if signal.is_cancelled() {
                tracing::debug!("Generation stopped by consumer");
            } else {
                tracing::debug!("End of generation token encountered");
            }
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| {
                GenerationError::Inference(format!("Failed to convert token to bytes: {}", e))
            })?;
        generated.extend_from_slice(&token_bytes);

        let snapshot = format!("{}{}", prompt, valid_utf8_prefix(&generated));
        if tx.send(EngineEvent::Step(snapshot)).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            break;
        }

        batch.clear();
        batch.add(new_token, n_decoded, &[0], true).map_err(|e| {
            GenerationError::Inference(format!("Failed to add token to batch: {}", e))
        })?;

        ctx.decode(&mut batch)
            .map_err(|e| GenerationError::Inference(format!("Failed to decode: {}", e)))?;

        n_decoded += 1;
    }

    Ok(())
}

/// Splits `len` prompt tokens into consecutive ranges of at most `batch_size`
fn batch_plan(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Longest prefix of `bytes` that is valid UTF-8
///
/// A multi-byte character split across tokens stays hidden until its last
/// byte arrives, so snapshot lengths never shrink.
fn valid_utf8_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            let valid = &bytes[..e.valid_up_to()];
            // valid_up_to guarantees this slice is UTF-8
            std::str::from_utf8(valid).unwrap_or_default()
        }
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
