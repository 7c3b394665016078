pub mod client;
pub mod error;
pub mod parse;
pub mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use types::{ChatCompleter, CompletionOutcome, CompletionRequest, Usage};
