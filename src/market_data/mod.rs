pub mod availability;
pub mod fetcher;
pub mod metrics;
pub mod quality;

// Re-export the workhorse types (e.g. `use crate::market_data::MarketDataFetcher`).
pub use availability::{AvailabilityClassifier, AvailabilitySample, AvailabilityState};
pub use fetcher::{FetchOpts, MarketDataFetcher};
pub use metrics::{BreakerState, ProviderMetric, ProviderMetricsRegistry};
pub use quality::{CircuitBreakerRecord, DataQualityGuard, QualityReport};
