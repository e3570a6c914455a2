//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection
//!     → request.rs (connection loop, exchange state, body reads)
//!         → parser.rs (request head, URL cooking, body framing)
//!         → auth.rs (Basic and provider schemes, 401 legs)
//!     → RequestQueue → application
//!     → response.rs (status line, headers, entity chunks)
//!     → websocket/ (after a 101 sent with the opaque flag)
//! ```

pub mod auth;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod websocket;

pub use auth::{AuthInfo, AuthStatus};
pub use headers::{HttpVersion, RequestHeader, RequestHeaders, ResponseHeader, ResponseHeaders, Verb};
pub use request::{HttpRequest, ReceiveFlags, Request, RequestStatus};
pub use response::{DataChunk, HttpResponse, SendFlags};
pub use websocket::{BufferType, WebSocket, WebSocketSettings};
