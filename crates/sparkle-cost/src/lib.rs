pub mod batcher;
pub mod budget;
pub mod complexity;
pub mod optimizer;
pub mod router;

pub use batcher::{BatchStats, RequestBatcher};
pub use budget::{BudgetDecision, BudgetManager, BudgetStatus};
pub use complexity::{Complexity, ComplexityAnalyzer, QueryContext};
pub use optimizer::{CostOptimizer, OptimizationPlan, OptimizeError};
pub use router::{ModelRouter, RouterStats};
