//! Header tables, verbs and protocol versions.
//!
//! Known headers live in a fixed array indexed by the header id, unknown
//! headers in a list in arrival order. Request and response tables share
//! ids 0..=19 (general and entity headers); the rest differ.

use std::fmt;
use std::marker::PhantomData;

/// A header with a fixed slot in a table.
pub trait KnownHeader: Copy + fmt::Debug + 'static {
    const COUNT: usize;
    const ALL: &'static [Self];

    fn index(self) -> usize;

    fn name(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|h| h.name().eq_ignore_ascii_case(name))
    }
}

macro_rules! known_headers {
    ($(#[$meta:meta])* $ty:ident { $($variant:ident = $index:literal => $name:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $ty {
            $($variant = $index,)*
        }

        impl KnownHeader for $ty {
            const COUNT: usize = [$($index),*].len();
            const ALL: &'static [Self] = &[$($ty::$variant),*];

            fn index(self) -> usize {
                self as usize
            }

            fn name(self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                }
            }
        }
    };
}

known_headers! {
    /// Request header ids.
    RequestHeader {
        CacheControl = 0 => "Cache-Control",
        Connection = 1 => "Connection",
        Date = 2 => "Date",
        KeepAlive = 3 => "Keep-Alive",
        Pragma = 4 => "Pragma",
        Trailer = 5 => "Trailer",
        TransferEncoding = 6 => "Transfer-Encoding",
        Upgrade = 7 => "Upgrade",
        Via = 8 => "Via",
        Warning = 9 => "Warning",
        Allow = 10 => "Allow",
        ContentLength = 11 => "Content-Length",
        ContentType = 12 => "Content-Type",
        ContentEncoding = 13 => "Content-Encoding",
        ContentLanguage = 14 => "Content-Language",
        ContentLocation = 15 => "Content-Location",
        ContentMd5 = 16 => "Content-MD5",
        ContentRange = 17 => "Content-Range",
        Expires = 18 => "Expires",
        LastModified = 19 => "Last-Modified",
        Accept = 20 => "Accept",
        AcceptCharset = 21 => "Accept-Charset",
        AcceptEncoding = 22 => "Accept-Encoding",
        AcceptLanguage = 23 => "Accept-Language",
        Authorization = 24 => "Authorization",
        Cookie = 25 => "Cookie",
        Expect = 26 => "Expect",
        From = 27 => "From",
        Host = 28 => "Host",
        IfMatch = 29 => "If-Match",
        IfModifiedSince = 30 => "If-Modified-Since",
        IfNoneMatch = 31 => "If-None-Match",
        IfRange = 32 => "If-Range",
        IfUnmodifiedSince = 33 => "If-Unmodified-Since",
        MaxForwards = 34 => "Max-Forwards",
        ProxyAuthorization = 35 => "Proxy-Authorization",
        Referer = 36 => "Referer",
        Range = 37 => "Range",
        Te = 38 => "TE",
        Translate = 39 => "Translate",
        UserAgent = 40 => "User-Agent",
    }
}

known_headers! {
    /// Response header ids.
    ResponseHeader {
        CacheControl = 0 => "Cache-Control",
        Connection = 1 => "Connection",
        Date = 2 => "Date",
        KeepAlive = 3 => "Keep-Alive",
        Pragma = 4 => "Pragma",
        Trailer = 5 => "Trailer",
        TransferEncoding = 6 => "Transfer-Encoding",
        Upgrade = 7 => "Upgrade",
        Via = 8 => "Via",
        Warning = 9 => "Warning",
        Allow = 10 => "Allow",
        ContentLength = 11 => "Content-Length",
        ContentType = 12 => "Content-Type",
        ContentEncoding = 13 => "Content-Encoding",
        ContentLanguage = 14 => "Content-Language",
        ContentLocation = 15 => "Content-Location",
        ContentMd5 = 16 => "Content-MD5",
        ContentRange = 17 => "Content-Range",
        Expires = 18 => "Expires",
        LastModified = 19 => "Last-Modified",
        AcceptRanges = 20 => "Accept-Ranges",
        Age = 21 => "Age",
        ETag = 22 => "ETag",
        Location = 23 => "Location",
        ProxyAuthenticate = 24 => "Proxy-Authenticate",
        RetryAfter = 25 => "Retry-After",
        Server = 26 => "Server",
        SetCookie = 27 => "Set-Cookie",
        Vary = 28 => "Vary",
        WwwAuthenticate = 29 => "WWW-Authenticate",
    }
}

/// Known-header array plus unknown headers in arrival order.
#[derive(Clone, PartialEq, Eq)]
pub struct Headers<H: KnownHeader> {
    known: Vec<Option<String>>,
    unknown: Vec<(String, String)>,
    _kind: PhantomData<H>,
}

impl<H: KnownHeader> Headers<H> {
    pub fn new() -> Self {
        Self {
            known: vec![None; H::COUNT],
            unknown: Vec::new(),
            _kind: PhantomData,
        }
    }

    pub fn get(&self, header: H) -> Option<&str> {
        self.known[header.index()].as_deref()
    }

    pub fn set(&mut self, header: H, value: impl Into<String>) {
        self.known[header.index()] = Some(value.into());
    }

    pub fn remove(&mut self, header: H) -> Option<String> {
        self.known[header.index()].take()
    }

    /// Add a value, joining with `, ` if the header is already present.
    pub fn append(&mut self, header: H, value: &str) {
        match &mut self.known[header.index()] {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            slot => *slot = Some(value.to_string()),
        }
    }

    pub fn add_unknown(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.unknown.push((name.into(), value.into()));
    }

    /// First unknown header with this name.
    pub fn unknown(&self, name: &str) -> Option<&str> {
        self.unknown
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn unknown_headers(&self) -> &[(String, String)] {
        &self.unknown
    }

    /// Route a parsed header to its known slot or the unknown list.
    pub fn insert_by_name(&mut self, name: &str, value: &str) {
        match H::from_name(name) {
            Some(header) => self.append(header, value),
            None => self.add_unknown(name, value),
        }
    }

    /// Look up by name in either part of the table.
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        match H::from_name(name) {
            Some(header) => self.get(header),
            None => self.unknown(name),
        }
    }

    /// Known headers in id order, then unknown headers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        H::ALL
            .iter()
            .filter_map(|h| self.get(*h).map(|v| (h.name(), v)))
            .chain(self.unknown.iter().map(|(n, v)| (n.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.known.iter().filter(|v| v.is_some()).count() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes these headers take on the wire.
    pub fn wire_len(&self) -> usize {
        self.iter().map(|(n, v)| n.len() + v.len() + 4).sum()
    }
}

impl<H: KnownHeader> Default for Headers<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: KnownHeader> fmt::Debug for Headers<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub type RequestHeaders = Headers<RequestHeader>;
pub type ResponseHeaders = Headers<ResponseHeader>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Track,
    Move,
    Copy,
    Propfind,
    Proppatch,
    Mkcol,
    Lock,
    Unlock,
    Search,
    Unknown(String),
}

impl Verb {
    pub fn parse(token: &str) -> Verb {
        match token {
            "OPTIONS" => Verb::Options,
            "GET" => Verb::Get,
            "HEAD" => Verb::Head,
            "POST" => Verb::Post,
            "PUT" => Verb::Put,
            "DELETE" => Verb::Delete,
            "TRACE" => Verb::Trace,
            "CONNECT" => Verb::Connect,
            "TRACK" => Verb::Track,
            "MOVE" => Verb::Move,
            "COPY" => Verb::Copy,
            "PROPFIND" => Verb::Propfind,
            "PROPPATCH" => Verb::Proppatch,
            "MKCOL" => Verb::Mkcol,
            "LOCK" => Verb::Lock,
            "UNLOCK" => Verb::Unlock,
            "SEARCH" => Verb::Search,
            other => Verb::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Options => "OPTIONS",
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Trace => "TRACE",
            Verb::Connect => "CONNECT",
            Verb::Track => "TRACK",
            Verb::Move => "MOVE",
            Verb::Copy => "COPY",
            Verb::Propfind => "PROPFIND",
            Verb::Proppatch => "PROPPATCH",
            Verb::Mkcol => "MKCOL",
            Verb::Lock => "LOCK",
            Verb::Unlock => "UNLOCK",
            Verb::Search => "SEARCH",
            Verb::Unknown(token) => token,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_1_0: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_1_1: HttpVersion = HttpVersion { major: 1, minor: 1 };

    pub fn parse(token: &str) -> Option<HttpVersion> {
        match token {
            "HTTP/1.1" => Some(Self::HTTP_1_1),
            "HTTP/1.0" => Some(Self::HTTP_1_0),
            _ => None,
        }
    }
}

impl Default for HttpVersion {
    fn default() -> Self {
        Self::HTTP_1_1
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizes_and_shared_ids() {
        assert_eq!(RequestHeader::COUNT, 41);
        assert_eq!(ResponseHeader::COUNT, 30);
        assert_eq!(RequestHeader::UserAgent.index(), 40);
        assert_eq!(ResponseHeader::WwwAuthenticate.index(), 29);
        for i in 0..20 {
            assert_eq!(RequestHeader::ALL[i].name(), ResponseHeader::ALL[i].name());
        }
    }

    #[test]
    fn duplicate_known_headers_are_joined() {
        let mut headers = RequestHeaders::new();
        headers.insert_by_name("accept", "text/html");
        headers.insert_by_name("Accept", "application/json");
        headers.insert_by_name("X-Trace", "1");
        headers.insert_by_name("X-Trace", "2");
        assert_eq!(headers.get(RequestHeader::Accept), Some("text/html, application/json"));
        assert_eq!(headers.unknown_headers().len(), 2);
        assert_eq!(headers.get_by_name("x-trace"), Some("1"));
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn iteration_puts_known_first_in_id_order() {
        let mut headers = ResponseHeaders::new();
        headers.add_unknown("X-A", "1");
        headers.set(ResponseHeader::Server, "s");
        headers.set(ResponseHeader::ContentLength, "0");
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["Content-Length", "Server", "X-A"]);
    }

    #[test]
    fn verbs_round_trip_and_unknown_is_kept() {
        assert_eq!(Verb::parse("PROPFIND"), Verb::Propfind);
        assert_eq!(Verb::parse("PATCH"), Verb::Unknown("PATCH".into()));
        assert_eq!(Verb::parse("PATCH").as_str(), "PATCH");
        assert_eq!(HttpVersion::parse("HTTP/1.0"), Some(HttpVersion::HTTP_1_0));
        assert_eq!(HttpVersion::parse("HTTP/2.0"), None);
    }
}
