//! Response composition.
//!
//! An [`HttpResponse`] is the application's description of a reply: status,
//! headers and a list of entity chunks. Chunks are resolved to concrete
//! byte sources before the head is written so `Content-Length` can be
//! filled in when the response is complete in one call.

use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HttpSysError, Result};
use crate::http::headers::{HttpVersion, ResponseHeader, ResponseHeaders};
use crate::queue::{ByteRange, FragmentCache, Verbosity};

/// File chunks are sent in blocks of this size.
pub const FILE_BLOCK_SIZE: usize = 16 * 1024;

/// Flags for `send_response` and `send_entity_body`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SendFlags(u32);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    /// Close the connection after this send.
    pub const DISCONNECT: SendFlags = SendFlags(0x01);
    /// More entity body follows in later calls.
    pub const MORE_DATA: SendFlags = SendFlags(0x02);
    /// Hand the connection over to the application (WebSocket upgrade).
    pub const OPAQUE: SendFlags = SendFlags(0x40);

    const ALL_BITS: u32 = 0x43;

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(HttpSysError::InvalidParameter("unknown send flag"));
        }
        Ok(Self(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// One piece of entity body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChunk {
    Memory(Vec<u8>),
    /// A byte range of a file. Length 0 means to the end of the file.
    File { path: PathBuf, range: ByteRange },
    /// A whole fragment from the queue's cache.
    Fragment { name: String },
    /// Part of a cached fragment. The range must lie within it.
    FragmentRange { name: String, range: ByteRange },
}

impl DataChunk {
    pub fn memory(data: impl Into<Vec<u8>>) -> Self {
        DataChunk::Memory(data.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        DataChunk::File {
            path: path.into(),
            range: ByteRange::whole(),
        }
    }

    pub fn fragment(name: impl Into<String>) -> Self {
        DataChunk::Fragment { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: ResponseHeaders,
    pub chunks: Vec<DataChunk>,
}

impl HttpResponse {
    /// A response with the standard reason phrase for `status`.
    pub fn new(status: u16) -> Self {
        Self {
            version: HttpVersion::HTTP_1_1,
            status,
            reason: reason_phrase(status).to_string(),
            headers: ResponseHeaders::new(),
            chunks: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_header(mut self, header: ResponseHeader, value: impl Into<String>) -> Self {
        self.headers.set(header, value);
        self
    }

    pub fn with_unknown_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add_unknown(name, value);
        self
    }

    pub fn with_chunk(mut self, chunk: DataChunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    pub fn with_body(self, body: impl Into<Vec<u8>>) -> Self {
        self.with_chunk(DataChunk::Memory(body.into()))
    }

    /// Status line, headers and the blank line.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Add `Date` and `Server` unless the application set them.
    pub(crate) fn add_default_headers(&mut self, server: &str) {
        if self.headers.get(ResponseHeader::Date).is_none() {
            self.headers.set(ResponseHeader::Date, http_date(SystemTime::now()));
        }
        if self.headers.get(ResponseHeader::Server).is_none() && !server.is_empty() {
            self.headers.set(ResponseHeader::Server, server);
        }
    }

    /// True if the headers delimit the body themselves.
    pub(crate) fn has_framing(&self) -> bool {
        self.headers.get(ResponseHeader::ContentLength).is_some()
            || self.headers.get(ResponseHeader::TransferEncoding).is_some()
    }
}

/// A chunk resolved to something that can be written.
#[derive(Debug, Clone)]
pub(crate) enum EntitySource {
    Bytes(Arc<[u8]>),
    File { path: PathBuf, offset: u64, length: u64 },
}

impl EntitySource {
    pub fn len(&self) -> u64 {
        match self {
            EntitySource::Bytes(data) => data.len() as u64,
            EntitySource::File { length, .. } => *length,
        }
    }
}

/// Resolve every chunk, failing before anything is written.
pub(crate) async fn resolve_chunks(chunks: &[DataChunk], fragments: &FragmentCache) -> Result<Vec<EntitySource>> {
    let mut sources = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let source = match chunk {
            DataChunk::Memory(data) => EntitySource::Bytes(Arc::from(data.as_slice())),
            DataChunk::Fragment { name } => EntitySource::Bytes(
                fragments
                    .find(name)
                    .ok_or_else(|| HttpSysError::NotFound(name.to_ascii_lowercase()))?,
            ),
            DataChunk::FragmentRange { name, range } => {
                EntitySource::Bytes(Arc::from(fragments.read(name, *range, usize::MAX)?))
            }
            DataChunk::File { path, range } => {
                let size = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| HttpSysError::NotFound(format!("{}: {e}", path.display())))?
                    .len();
                if range.start > size {
                    return Err(HttpSysError::InvalidParameter("file range starts beyond end of file"));
                }
                let available = size - range.start;
                let length = if range.length == 0 {
                    available
                } else {
                    range.length.min(available)
                };
                EntitySource::File {
                    path: path.clone(),
                    offset: range.start,
                    length,
                }
            }
        };
        sources.push(source);
    }
    Ok(sources)
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Short text used in built-in error pages.
pub fn error_text(status: u16) -> &'static str {
    match status {
        400 => "General client error",
        401 => "Not authenticated",
        404 => "Not found",
        503 => "Service temporarily unavailable",
        _ if status >= 500 => "General server error",
        _ => "General client error",
    }
}

/// Built-in error page with the code and text filled in.
pub fn error_page(status: u16, text: &str) -> String {
    format!(
        "<html>\n<head><title>{status} {text}</title></head>\n\
         <body>\n<h1>Error {status}</h1>\n<p>{text}</p>\n</body>\n</html>\n"
    )
}

/// A complete error response written straight to the wire.
pub fn error_response(status: u16, text: &str, server: &str, close: bool) -> Vec<u8> {
    let body = error_page(status, text);
    let mut response = HttpResponse::new(status)
        .with_header(ResponseHeader::ContentType, "text/html")
        .with_header(ResponseHeader::ContentLength, body.len().to_string());
    if close {
        response.headers.set(ResponseHeader::Connection, "close");
    }
    response.add_default_headers(server);
    let mut bytes = response.head_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

/// The 503 written when a request cannot be queued.
pub fn service_unavailable(verbosity: Verbosity, reason: &str, server: &str) -> Vec<u8> {
    match verbosity {
        Verbosity::Basic => {
            let mut response = HttpResponse::new(503)
                .with_header(ResponseHeader::ContentLength, "0")
                .with_header(ResponseHeader::Connection, "close");
            response.add_default_headers(server);
            response.head_bytes()
        }
        Verbosity::Limited => error_response(503, error_text(503), server, true),
        Verbosity::Full => error_response(503, &format!("{}: {reason}", error_text(503)), server, true),
    }
}

/// RFC 1123 date, as used in the `Date` header.
pub fn http_date(time: SystemTime) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    let rem = secs % 86_400;
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAYS[(days % 7) as usize],
        day,
        MONTHS[(month - 1) as usize],
        year,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
