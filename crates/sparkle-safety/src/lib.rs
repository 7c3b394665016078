pub mod content;
pub mod jailbreak;
pub mod metrics;
pub mod pii;
pub mod pipeline;
pub mod redact;

pub use content::{ContentSafety, ContentViolation};
pub use jailbreak::{JailbreakAssessment, JailbreakDetector, Severity};
pub use metrics::SafetyMetrics;
pub use pii::{PiiDetector, PiiKind, PiiReport, RiskLevel};
pub use pipeline::{InputVerdict, OutputVerdict, SafetyPipeline};
pub use redact::Redactor;
