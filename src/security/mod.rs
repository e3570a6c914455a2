//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Authorization header on a protected URL group:
//!     Basic     → throttle.rs (per-peer failed-logon bucket)
//!               → credentials.rs (CredentialProvider::logon)
//!     other     → provider.rs (SecurityProvider::step per leg)
//!     none      → reaches the application as NotAuthenticated
//! ```
//!
//! # Design Decisions
//! - Fail closed: the default provider denies every exchange
//! - A throttled peer never reaches the credential provider

pub mod credentials;
pub mod provider;
pub mod throttle;

pub use credentials::{AccessToken, CredentialProvider, LocalAccounts};
pub use provider::{DenyAll, SecurityProvider, SecurityStep};
pub use throttle::LogonThrottle;
