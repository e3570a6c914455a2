//! Structured logging.
//!
//! Log level comes from `RUST_LOG` when set, otherwise from the host
//! configuration. Wire hex dumps are emitted at `trace` and only when the
//! session's logging level asks for them.

use std::fmt::Write as _;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging level at which raw wire buffers are dumped.
pub const HEX_DUMP_LEVEL: u8 = 3;

/// Install the global subscriber. Calling twice is harmless.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Dump `data` as a classic 16-bytes-per-row hex listing if `level` asks for it.
pub fn hex_dump(level: u8, direction: &'static str, data: &[u8]) {
    if level < HEX_DUMP_LEVEL || data.is_empty() {
        return;
    }
    tracing::trace!(direction, bytes = data.len(), "\n{}", format_hex(data));
}

pub fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        out.extend(chunk.iter().map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' }));
        out.push('\n');
    }
    out
}
