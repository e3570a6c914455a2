//! URL prefix parsing and segment-aligned matching.
//!
//! A prefix has the form `http[s]://host[:port]/path/`. The host decides
//! the binding kind:
//!
//! ```text
//! +            strong wildcard, any host
//! *            weak wildcard, used when nothing else matched
//! 10.0.0.1     address (leading digit or '[')
//! www.a.com    fully qualified name (contains '.')
//! server       named host
//! ```

use std::fmt;

use crate::config::SslBinding;
use crate::error::{HttpSysError, Result};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Strong,
    Weak,
    Named,
    FullyQualified,
    Address,
}

/// A registered prefix. Immutable once inside a URL group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPrefix {
    /// Lowercased prefix, used as the registration key.
    pub key: String,
    pub secure: bool,
    pub binding: Binding,
    pub host: String,
    pub port: u16,
    pub abs_path: String,
    pub context: u64,
    /// Certificate binding, resolved for secure prefixes on registration.
    pub tls: Option<SslBinding>,
}

impl UrlPrefix {
    pub fn parse(prefix: &str, context: u64) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = strip_scheme(prefix, "https://") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(prefix, "http://") {
            (false, rest)
        } else {
            return Err(HttpSysError::InvalidParameter("prefix scheme must be http or https"));
        };

        let slash = rest
            .find('/')
            .ok_or(HttpSysError::InvalidParameter("prefix has no absolute path"))?;
        let (authority, abs_path) = rest.split_at(slash);
        if !abs_path.ends_with('/') {
            return Err(HttpSysError::InvalidParameter("prefix path must end with '/'"));
        }

        let (host, port) = split_authority(authority)?;
        let port = match port {
            Some(port) => port,
            None if secure => DEFAULT_HTTPS_PORT,
            None => DEFAULT_HTTP_PORT,
        };
        if host.is_empty() {
            return Err(HttpSysError::InvalidParameter("prefix has no host"));
        }

        let binding = classify_host(host);
        Ok(Self {
            key: prefix.to_ascii_lowercase(),
            secure,
            binding,
            host: host.to_ascii_lowercase(),
            port,
            abs_path: abs_path.to_string(),
            context,
            tls: None,
        })
    }

    /// Length of the match against a normalized request path, 0 if none.
    pub fn match_len(&self, path: &str) -> usize {
        segmented_compare(&self.abs_path, path)
    }
}

impl fmt::Display for UrlPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn strip_scheme<'a>(prefix: &'a str, scheme: &str) -> Option<&'a str> {
    let head = prefix.get(..scheme.len())?;
    if head.eq_ignore_ascii_case(scheme) {
        Some(&prefix[scheme.len()..])
    } else {
        None
    }
}

fn split_authority(authority: &str) -> Result<(&str, Option<u16>)> {
    // IPv6 literals carry colons inside brackets.
    let port_sep = if authority.starts_with('[') {
        let close = authority
            .find(']')
            .ok_or(HttpSysError::InvalidParameter("unterminated IPv6 literal"))?;
        authority[close..].find(':').map(|p| p + close)
    } else {
        authority.rfind(':')
    };

    match port_sep {
        Some(pos) => {
            let port: u16 = authority[pos + 1..]
                .parse()
                .map_err(|_| HttpSysError::InvalidParameter("prefix port is not a number"))?;
            if port == 0 {
                return Err(HttpSysError::InvalidParameter("prefix port must not be zero"));
            }
            Ok((&authority[..pos], Some(port)))
        }
        None => Ok((authority, None)),
    }
}

fn classify_host(host: &str) -> Binding {
    match host {
        "+" => Binding::Strong,
        "*" => Binding::Weak,
        _ if host.starts_with(|c: char| c.is_ascii_digit() || c == '[') => Binding::Address,
        _ if host.contains('.') => Binding::FullyQualified,
        _ => Binding::Named,
    }
}

/// Compare two absolute paths one whole segment at a time.
///
/// Returns the prefix length if every segment of `prefix` equals the
/// corresponding segment of `path` (ASCII case-insensitive), otherwise 0.
/// Segments keep their trailing '/', so `/ab/` never matches `/abc/`.
pub fn segmented_compare(prefix: &str, path: &str) -> usize {
    if !prefix.starts_with('/') || !path.starts_with('/') {
        return 0;
    }
    let mut theirs = path.split_inclusive('/');
    let mut matched = 0;
    for segment in prefix.split_inclusive('/') {
        match theirs.next() {
            Some(other) if other.eq_ignore_ascii_case(segment) => matched += segment.len(),
            _ => return 0,
        }
    }
    matched
}

/// Prepare a request path for prefix matching.
///
/// Drops the query and appends '/' when the last segment does not look
/// like a file name, so `/app` can match the prefix `/app/`.
pub fn normalize_request_path(abs_path: &str) -> String {
    let path = abs_path
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let mut path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let last = path.rsplit('/').next().unwrap_or_default();
    if !last.is_empty() && !last.contains('.') {
        path.push('/');
    }
    path
}
