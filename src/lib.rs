//! Legal-GPT Library
//!
//! Streaming inference bridge for an instruction-tuned legal assistant:
//! prompt rendering, a llama-cpp generation engine, and the worker/channel
//! bridge that turns a blocking generation into a pull-based answer stream.

pub mod inference;
pub mod prompt;
pub mod storage;
pub mod types;
