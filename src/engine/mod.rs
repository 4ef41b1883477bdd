mod admin;
mod aggregate;
mod breaker;
mod bulk;
mod cache;
mod decision;
mod registry;

pub use admin::{AddSuppression, RemoveSuppression, SuppressionAdmin, UpdateSuppression};
pub use breaker::{BreakerRegistry, BreakerSettings, BreakerStats, CircuitBreaker};
pub use bulk::{BulkEvaluator, BulkItemError, BulkItemResult, BulkResult, BulkSettings, BulkSummary};
pub use cache::{CacheStats, DecisionCache};
pub use decision::{CheckOptions, DecisionEngine, EngineSettings};
pub use registry::ProviderRegistry;
