mod entry;
mod phone;
mod provider;
mod verdict;

pub use entry::{
    ComplianceLevel, ListSource, Metadata, Severity, SuppressReason, SuppressionEntry, SyncType,
};
pub use phone::PhoneNumber;
pub use provider::{
    AuthType, CircuitState, FeedFormat, Provider, ProviderHealth, ProviderStatus,
    ProviderStatusReport, CUSTOM_PROVIDER_ID, INTERNAL_PROVIDER_ID,
};
pub use verdict::{BlockingReason, DecisionCode, Recommendation, Verdict};
