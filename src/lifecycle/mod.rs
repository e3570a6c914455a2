//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     Ctrl-C / SIGTERM → host begins shutdown
//!
//! Shutdown (shutdown.rs):
//!     Listener::stop() → trigger → accept loops exit
//!         → close idle connections → drain (bounded) → release sockets
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
