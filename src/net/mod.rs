//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, endpoint and connection quotas)
//!     → connection.rs (id, tracking for drain)
//!     → stream.rs (timeouts, abort, hex dump)
//!     → tls/ (negotiation on secure ports)
//!     → Hand off to the HTTP layer
//! ```
//!
//! # Design Decisions
//! - One accept task per bound address; a spawned task per connection
//! - Accept errors back off exponentially instead of spinning
//! - A stopping listener keeps its sockets until connections drained

pub mod backoff;
pub mod connection;
pub mod listener;
pub mod stream;
pub mod tls;
