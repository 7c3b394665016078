pub mod canary;
pub mod shadow;

pub use canary::{CanaryController, CanaryStatus, StageHealth};
pub use shadow::{PromotionCheck, ShadowAnalysis, ShadowInvoker, ShadowReply, ShadowRunner};
