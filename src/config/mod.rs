//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! host config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HostConfig (validated, immutable)
//!     → session tunables, listener addresses, local accounts
//!
//! registry file (TOML: url_acl, ssl_binding)
//!     → registry.rs (RegistryStore behind ArcSwap)
//!     → queried by URL groups through the ConfigStore trait
//!
//! On registry change:
//!     watcher.rs detects change
//!     → registry.rs reloads
//!     → atomic swap, lookups in flight keep the old snapshot
//! ```
//!
//! # Design Decisions
//! - The core only reads the store; nothing here writes bindings back
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod registry;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use registry::{ConfigStore, Registry, RegistryStore, SslBinding};
pub use schema::HostConfig;
