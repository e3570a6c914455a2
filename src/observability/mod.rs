//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! listener / request / queue / tls
//!     → logging.rs (tracing events, optional wire hex dumps)
//!     → metrics.rs (counters and a latency histogram)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape endpoint when configured
//! ```

pub mod logging;
pub mod metrics;
