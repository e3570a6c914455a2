//! Minimal ClientHello decoder.
//!
//! Looks at the first TLS records a client sends and pulls out what the
//! server needs before the handshake engine starts: the offered version
//! and the SNI host name. Works on a byte slice only.

use thiserror::Error;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const SERVER_NAME_HOST: u8 = 0;
const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const MAX_HELLO_LEN: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// `client_version` field from the hello body.
    pub version: u16,
    pub server_name: Option<String>,
    /// Length of the records carrying the hello, headers included.
    pub record_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloStatus {
    /// Not enough bytes for the first record yet.
    NeedMoreData,
    Complete(ClientHello),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HelloError {
    #[error("first record is not a handshake record (content type {0})")]
    NotHandshake(u8),
    #[error("first handshake message is not a ClientHello (type {0})")]
    NotClientHello(u8),
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
}

/// Decode the ClientHello at the start of `data`. The message may span
/// several handshake records; they are reassembled before decoding.
pub fn parse(data: &[u8]) -> Result<HelloStatus, HelloError> {
    let mut handshake = Vec::new();
    let mut offset = 0;
    let msg_len = loop {
        let Some(header) = data.get(offset..offset + RECORD_HEADER_LEN) else {
            return Ok(HelloStatus::NeedMoreData);
        };
        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(HelloError::NotHandshake(header[0]));
        }
        let body_len = usize::from(u16::from_be_bytes([header[3], header[4]]));
        if body_len == 0 {
            return Err(HelloError::Malformed("empty handshake record"));
        }
        let end = offset + RECORD_HEADER_LEN + body_len;
        let Some(body) = data.get(offset + RECORD_HEADER_LEN..end) else {
            return Ok(HelloStatus::NeedMoreData);
        };
        handshake.extend_from_slice(body);
        offset = end;

        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(HelloError::NotClientHello(handshake[0]));
        }
        if handshake.len() < HANDSHAKE_HEADER_LEN {
            continue;
        }
        let msg_len = Reader::new(&handshake[1..HANDSHAKE_HEADER_LEN]).u24()?;
        if msg_len > MAX_HELLO_LEN {
            return Err(HelloError::Malformed("ClientHello too large"));
        }
        if handshake.len() >= HANDSHAKE_HEADER_LEN + msg_len {
            break msg_len;
        }
    };
    let record_len = offset;
    let mut hello = Reader::new(&handshake[HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + msg_len]);

    let version = hello.u16()?;
    hello.skip(32)?;
    let session_id = usize::from(hello.u8()?);
    hello.skip(session_id)?;
    let suites = usize::from(hello.u16()?);
    hello.skip(suites)?;
    let compression = usize::from(hello.u8()?);
    hello.skip(compression)?;

    let mut server_name = None;
    if !hello.is_empty() {
        let ext_len = usize::from(hello.u16()?);
        let mut exts = Reader::new(hello.take(ext_len)?);
        while !exts.is_empty() {
            let ext_type = exts.u16()?;
            let len = usize::from(exts.u16()?);
            let body = exts.take(len)?;
            if ext_type == EXTENSION_SERVER_NAME {
                server_name = parse_server_name(body)?;
            }
        }
    }

    Ok(HelloStatus::Complete(ClientHello {
        version,
        server_name,
        record_len,
    }))
}

fn parse_server_name(body: &[u8]) -> Result<Option<String>, HelloError> {
    let mut r = Reader::new(body);
    let list_len = usize::from(r.u16()?);
    let mut list = Reader::new(r.take(list_len)?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let len = usize::from(list.u16()?);
        let name = list.take(len)?;
        if name_type == SERVER_NAME_HOST {
            let name = std::str::from_utf8(name).map_err(|_| HelloError::Malformed("server name is not UTF-8"))?;
            return Ok(Some(name.to_ascii_lowercase()));
        }
    }
    Ok(None)
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HelloError> {
        if self.data.len() < n {
            return Err(HelloError::Malformed("length runs past end of record"));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), HelloError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, HelloError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, HelloError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, HelloError> {
        let b = self.take(3)?;
        Ok((usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a ClientHello record, optionally with an SNI extension.
    pub(crate) fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0xAB; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);

        let mut exts = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            let entry_len = 3 + name.len();
            exts.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            exts.extend_from_slice(&((entry_len + 2) as u16).to_be_bytes());
            exts.extend_from_slice(&(entry_len as u16).to_be_bytes());
            exts.push(SERVER_NAME_HOST);
            exts.extend_from_slice(&(name.len() as u16).to_be_bytes());
            exts.extend_from_slice(name);
        }
        // supported_versions, ignored by the decoder
        exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_and_version() {
        let record = client_hello(Some("WWW.Example.com"));
        match parse(&record).unwrap() {
            HelloStatus::Complete(hello) => {
                assert_eq!(hello.version, 0x0303);
                assert_eq!(hello.server_name.as_deref(), Some("www.example.com"));
                assert_eq!(hello.record_len, record.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_sni_is_none() {
        let record = client_hello(None);
        let HelloStatus::Complete(hello) = parse(&record).unwrap() else {
            panic!("expected a complete hello");
        };
        assert_eq!(hello.server_name, None);
    }

    #[test]
    fn truncated_record_needs_more_data() {
        let record = client_hello(Some("localhost"));
        for cut in [0, 1, 4, 5, 20, record.len() - 1] {
            assert_eq!(parse(&record[..cut]).unwrap(), HelloStatus::NeedMoreData, "cut at {cut}");
        }
        // one more read completes it
        assert!(matches!(parse(&record).unwrap(), HelloStatus::Complete(_)));
    }

    #[test]
    fn trailing_bytes_after_first_record_are_ignored() {
        let mut data = client_hello(Some("a.test"));
        let len = data.len();
        data.extend_from_slice(&[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        let HelloStatus::Complete(hello) = parse(&data).unwrap() else {
            panic!("expected a complete hello");
        };
        assert_eq!(hello.record_len, len);
    }

    #[test]
    fn hello_split_across_records_is_reassembled() {
        let record = client_hello(Some("split.test"));
        let handshake = &record[RECORD_HEADER_LEN..];
        for at in [2, 20, handshake.len() - 1] {
            let (first, second) = handshake.split_at(at);
            let mut data = Vec::new();
            for part in [first, second] {
                data.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
                data.extend_from_slice(&(part.len() as u16).to_be_bytes());
                data.extend_from_slice(part);
            }
            assert_eq!(parse(&data[..data.len() - 1]).unwrap(), HelloStatus::NeedMoreData);
            let HelloStatus::Complete(hello) = parse(&data).unwrap() else {
                panic!("expected a complete hello when split at {at}");
            };
            assert_eq!(hello.server_name.as_deref(), Some("split.test"));
            assert_eq!(hello.record_len, data.len());
        }
    }

    #[test]
    fn oversized_hello_is_rejected() {
        let data = [CONTENT_TYPE_HANDSHAKE, 0x03, 0x01, 0x00, 0x04, HANDSHAKE_CLIENT_HELLO, 0xFF, 0xFF, 0xFF];
        assert_eq!(parse(&data), Err(HelloError::Malformed("ClientHello too large")));
    }

    #[test]
    fn rejects_plain_http_and_other_handshakes() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\n"), Err(HelloError::NotHandshake(b'G')));

        let mut record = client_hello(None);
        record[5] = 2;
        assert_eq!(parse(&record), Err(HelloError::NotClientHello(2)));
    }

    #[test]
    fn bad_lengths_are_malformed_not_panics() {
        let mut record = client_hello(Some("localhost"));
        // session id length pointing past the end
        record[5 + 4 + 2 + 32] = 0xFF;
        assert!(matches!(parse(&record), Err(HelloError::Malformed(_))));
    }
}
