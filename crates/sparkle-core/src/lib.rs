pub mod config;
pub mod error;
pub mod types;

pub use config::SparkleConfig;
pub use error::{Result, SparkleError};
pub use types::{Action, ChatMessage, Role, Tier};
