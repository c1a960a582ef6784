pub mod logging;
pub mod metrics;

pub use logging::RelayRootSpan;
pub use metrics::MetricsMiddleware;
