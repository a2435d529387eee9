//! Minimal client for a local Ollama instance.
//!
//! The inference service is an external collaborator: this crate only knows
//! how to list models, switch the process-wide default model and run a
//! non-streaming generation with an assembled composite prompt.

mod client;
mod prompt;

pub use client::GenerateOptions;
pub use client::GenerateRequest;
pub use client::LlmError;
pub use client::ModelInfo;
pub use client::OllamaClient;
pub use prompt::build_prompt;
