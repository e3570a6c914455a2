//! HTTP/1.x wire parsing.
//!
//! `parse_head` works on the bytes read so far and reports `None` until the
//! blank line ending the head has arrived. Bodies are framed either by
//! `Content-Length` or by chunked transfer coding; [`BodyFraming`] pulls
//! decoded bytes out of the connection buffer as they become available.

use thiserror::Error;

use crate::http::headers::{HttpVersion, RequestHeader, RequestHeaders, Verb};

/// Largest request head accepted, matching the initial read buffer.
pub const MAX_HEAD_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    RequestLine,
    #[error("unsupported protocol version {0:?}")]
    Version(String),
    #[error("malformed header line {0:?}")]
    HeaderLine(String),
    #[error("request head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,
    #[error("invalid content length {0:?}")]
    ContentLength(String),
    #[error("malformed chunked body")]
    Chunk,
}

/// Request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub verb: Verb,
    pub raw_url: String,
    pub version: HttpVersion,
    pub headers: RequestHeaders,
}

impl RequestHead {
    /// Body framing declared by the headers.
    pub fn framing(&self) -> Result<BodyFraming, ParseError> {
        if let Some(te) = self.headers.get(RequestHeader::TransferEncoding) {
            let last = te.rsplit(',').next().unwrap_or_default().trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked(ChunkedDecoder::new()));
            }
        }
        match self.headers.get(RequestHeader::ContentLength) {
            Some(raw) => {
                let length = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::ContentLength(raw.to_string()))?;
                Ok(BodyFraming::Length { remaining: length })
            }
            None => Ok(BodyFraming::Length { remaining: 0 }),
        }
    }

    /// Connection persistence after this exchange.
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers.get(RequestHeader::Connection).unwrap_or_default();
        let has = |token: &str| connection.split(',').any(|t| t.trim().eq_ignore_ascii_case(token));
        if self.version >= HttpVersion::HTTP_1_1 {
            !has("close")
        } else {
            has("keep-alive")
        }
    }
}

/// Parse a request head. `Ok(None)` means the blank line has not arrived.
/// On success the second value is the head length including the blank line.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ParseError> {
    // Tolerate stray CRLFs between pipelined requests.
    let mut start = 0;
    while buf[start..].starts_with(b"\r\n") {
        start += 2;
    }
    let Some(end) = find(&buf[start..], b"\r\n\r\n") else {
        if buf.len() >= MAX_HEAD_LEN {
            return Err(ParseError::HeadTooLarge);
        }
        return Ok(None);
    };
    let head_len = start + end + 4;
    if head_len > MAX_HEAD_LEN {
        return Err(ParseError::HeadTooLarge);
    }

    let text = std::str::from_utf8(&buf[start..start + end])
        .map_err(|_| ParseError::HeaderLine("non UTF-8 bytes in head".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::RequestLine)?;
    let (verb, raw_url, version) = parse_request_line(request_line)?;

    let mut headers = RequestHeaders::new();
    let mut last: Option<(String, String)> = None;
    for line in lines {
        if line.starts_with([' ', '\t']) {
            // obsolete line folding continues the previous value
            let (_, value) = last
                .as_mut()
                .ok_or_else(|| ParseError::HeaderLine(line.to_string()))?;
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        if let Some((name, value)) = last.take() {
            headers.insert_by_name(&name, &value);
        }
        last = Some(parse_header_line(line)?);
    }
    if let Some((name, value)) = last {
        headers.insert_by_name(&name, &value);
    }

    Ok(Some((
        RequestHead {
            verb,
            raw_url,
            version,
            headers,
        },
        head_len,
    )))
}

fn parse_request_line(line: &str) -> Result<(Verb, String, HttpVersion), ParseError> {
    let mut parts = line.split(' ');
    let (Some(verb), Some(url), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::RequestLine);
    };
    if verb.is_empty() || !verb.bytes().all(is_token_byte) || url.is_empty() {
        return Err(ParseError::RequestLine);
    }
    let version = HttpVersion::parse(version).ok_or_else(|| ParseError::Version(version.to_string()))?;
    Ok((Verb::parse(verb), url.to_string(), version))
}

fn parse_header_line(line: &str) -> Result<(String, String), ParseError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ParseError::HeaderLine(line.to_string()))?;
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(ParseError::HeaderLine(line.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decoded URL parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookedUrl {
    pub full: String,
    pub host: String,
    pub abs_path: String,
    /// Query including the leading `?`, empty when absent.
    pub query: String,
}

/// Cook a raw request target. `default_host` is used when the request
/// names no host (HTTP/1.0 without Host).
pub fn cook_url(raw_url: &str, host_header: Option<&str>, secure: bool, default_host: &str) -> CookedUrl {
    let scheme = if secure { "https" } else { "http" };
    let (url_host, target) = match raw_url.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(slash) => (Some(&rest[..slash]), &rest[slash..]),
            None => (Some(rest), "/"),
        },
        None => (None, raw_url),
    };
    let host = url_host
        .filter(|h| !h.is_empty())
        .or(host_header.filter(|h| !h.is_empty()))
        .unwrap_or(default_host)
        .to_string();

    let target = target.split('#').next().unwrap_or_default();
    let (path, query) = match target.find('?') {
        Some(q) => (&target[..q], &target[q..]),
        None => (target, ""),
    };
    let abs_path = percent_decode(if path.is_empty() { "/" } else { path });

    CookedUrl {
        full: format!("{scheme}://{host}{abs_path}{query}"),
        host,
        abs_path,
        query: query.to_string(),
    }
}

/// Decode `%XX` escapes. Invalid escapes are kept as written.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |b: u8| (b as char).to_digit(16);
            if let (Some(h), Some(l)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((h * 16 + l) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// How the rest of a request body is delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyFraming {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
}

impl BodyFraming {
    pub fn is_done(&self) -> bool {
        match self {
            BodyFraming::Length { remaining } => *remaining == 0,
            BodyFraming::Chunked(decoder) => decoder.is_done(),
        }
    }

    /// Bytes still expected, when known.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            BodyFraming::Length { remaining } => Some(*remaining),
            BodyFraming::Chunked(_) => None,
        }
    }

    /// Move up to `max` decoded body bytes out of `buf`.
    pub fn take(&mut self, buf: &mut Vec<u8>, max: usize) -> Result<Vec<u8>, ParseError> {
        match self {
            BodyFraming::Length { remaining } => {
                let n = (*remaining).min(buf.len() as u64).min(max as u64) as usize;
                *remaining -= n as u64;
                Ok(buf.drain(..n).collect())
            }
            BodyFraming::Chunked(decoder) => decoder.decode(buf, max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for chunked transfer coding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decode as much of `buf` as possible, up to `max` payload bytes.
    /// Consumed input is removed from `buf`.
    pub fn decode(&mut self, buf: &mut Vec<u8>, max: usize) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(eol) = find(&buf[pos..], b"\r\n") else { break };
                    let line = std::str::from_utf8(&buf[pos..pos + eol]).map_err(|_| ParseError::Chunk)?;
                    let size = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size, 16).map_err(|_| ParseError::Chunk)?;
                    pos += eol + 2;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(left) => {
                    let room = max - out.len();
                    let n = left.min((buf.len() - pos) as u64).min(room as u64) as usize;
                    out.extend_from_slice(&buf[pos..pos + n]);
                    pos += n;
                    let left = left - n as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    if left > 0 {
                        break;
                    }
                }
                ChunkState::DataEnd => {
                    if buf.len() - pos < 2 {
                        break;
                    }
                    if &buf[pos..pos + 2] != b"\r\n" {
                        return Err(ParseError::Chunk);
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(eol) = find(&buf[pos..], b"\r\n") else { break };
                    pos += eol + 2;
                    if eol == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
            if out.len() >= max {
                break;
            }
        }
        buf.drain(..pos);
        Ok(out)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        parse_head(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn parses_request_line_and_headers() {
        let raw = "GET /app/users?x=1 HTTP/1.1\r\nHost: example.com\r\nAccept: a\r\nAccept: b\r\nX-Id: 7\r\n\r\nBODY";
        let (head, len) = parse_head(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(len, raw.len() - 4);
        assert_eq!(head.verb, Verb::Get);
        assert_eq!(head.raw_url, "/app/users?x=1");
        assert_eq!(head.version, HttpVersion::HTTP_1_1);
        assert_eq!(head.headers.get(RequestHeader::Host), Some("example.com"));
        assert_eq!(head.headers.get(RequestHeader::Accept), Some("a, b"));
        assert_eq!(head.headers.unknown("x-id"), Some("7"));
    }

    #[test]
    fn incomplete_head_needs_more() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap(), None);
        assert_eq!(parse_head(b"").unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(parse_head(b"GET /\r\n\r\n"), Err(ParseError::RequestLine));
        assert!(matches!(
            parse_head(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n"),
            Err(ParseError::HeaderLine(_))
        ));
        assert!(matches!(
            parse_head(b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n"),
            Err(ParseError::HeaderLine(_))
        ));
        assert!(matches!(parse_head(b"GET / HTTP/3\r\n\r\n"), Err(ParseError::Version(_))));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX: ".to_vec();
        raw.resize(MAX_HEAD_LEN + 10, b'a');
        assert_eq!(parse_head(&raw), Err(ParseError::HeadTooLarge));
    }

    #[test]
    fn folded_header_and_leading_crlf() {
        let head = head("\r\nGET / HTTP/1.1\r\nX-Long: one\r\n  two\r\n\r\n");
        assert_eq!(head.headers.unknown("X-Long"), Some("one two"));
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        assert!(head("GET / HTTP/1.1\r\n\r\n").keep_alive());
        assert!(!head("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!head("GET / HTTP/1.0\r\n\r\n").keep_alive());
        assert!(head("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").keep_alive());
    }

    #[test]
    fn framing_from_headers() {
        let h = head("POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(h.framing().unwrap(), BodyFraming::Length { remaining: 12 });
        let h = head("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert!(matches!(h.framing().unwrap(), BodyFraming::Chunked(_)));
        let h = head("POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n");
        assert!(h.framing().is_err());
    }

    #[test]
    fn cooks_origin_and_absolute_forms() {
        let url = cook_url("/a%20b/c?q=1#frag", Some("example.com:8080"), false, "local");
        assert_eq!(url.host, "example.com:8080");
        assert_eq!(url.abs_path, "/a b/c");
        assert_eq!(url.query, "?q=1");
        assert_eq!(url.full, "http://example.com:8080/a b/c?q=1");

        let url = cook_url("http://other.test/x", Some("ignored"), true, "local");
        assert_eq!(url.full, "https://other.test/x");

        let url = cook_url("/", None, false, "127.0.0.1:80");
        assert_eq!(url.full, "http://127.0.0.1:80/");
    }

    #[test]
    fn percent_decode_keeps_bad_escapes() {
        assert_eq!(percent_decode("%41%zz%4"), "A%zz%4");
        assert_eq!(percent_decode("%"), "%");
    }

    #[test]
    fn chunked_body_decodes_across_reads() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = b"5\r\nhel".to_vec();
        assert_eq!(decoder.decode(&mut buf, 1024).unwrap(), b"hel");
        buf.extend_from_slice(b"lo\r\n6;ext=1\r\n world\r\n0\r\nTrailer: x\r\n\r\nNEXT");
        assert_eq!(decoder.decode(&mut buf, 1024).unwrap(), b"lo world");
        assert!(decoder.is_done());
        assert_eq!(buf, b"NEXT");
    }

    #[test]
    fn chunked_respects_max_and_rejects_garbage() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = b"a\r\n0123456789\r\n0\r\n\r\n".to_vec();
        assert_eq!(decoder.decode(&mut buf, 4).unwrap(), b"0123");
        assert_eq!(decoder.decode(&mut buf, 100).unwrap(), b"456789");
        assert!(decoder.is_done());

        let mut decoder = ChunkedDecoder::new();
        let mut buf = b"zz\r\n".to_vec();
        assert_eq!(decoder.decode(&mut buf, 10), Err(ParseError::Chunk));
    }

    #[test]
    fn length_framing_takes_at_most_remaining() {
        let mut framing = BodyFraming::Length { remaining: 3 };
        let mut buf = b"abcdef".to_vec();
        assert_eq!(framing.take(&mut buf, 10).unwrap(), b"abc");
        assert!(framing.is_done());
        assert_eq!(buf, b"def");
    }
}
