pub mod engine;
pub mod error;
pub mod prompt;
pub mod session;

pub use engine::{ChatMetadata, ChatOutcome, ChatResponse, ConversationEngine, StartedConversation};
pub use error::EngineError;
pub use session::{SessionRegistry, SessionState};
