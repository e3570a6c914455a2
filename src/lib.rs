//! User-mode HTTP server API.
//!
//! Applications register URL prefixes in URL groups, bind the groups to
//! request queues and pull parsed requests from the queues. Listeners,
//! TLS, authentication, keep-alive and WebSocket framing happen here.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod handles;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod queue;
pub mod security;
pub mod session;

/// `Server` header value added to every response that lacks one.
pub const DEFAULT_SERVER_HEADER: &str = "Microsoft-HTTPAPI/2.0";

pub use api::{HttpSys, InitFlags, Property, PropertyId};
pub use config::HostConfig;
pub use context::{ServerSettings, Services};
pub use error::{HttpSysError, Result};
pub use handles::Handle;
pub use lifecycle::Shutdown;
pub use session::ApiVersion;
