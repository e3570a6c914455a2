//! Per-queue response fragment cache.
//!
//! Fragments are pre-rendered byte buffers stored under a URL-prefix-like
//! name. Names are case-folded on every operation. A flush removes one
//! name, or with `recursive` every name that starts with it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{HttpSysError, Result};
use crate::handles::Handle;
use crate::session::lock;

/// How long a fragment stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Valid until flushed.
    UserInvalidates,
    /// Valid for the given time after insertion.
    TimeToLive(Duration),
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::UserInvalidates
    }
}

/// Byte range within a fragment. A zero length means "to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub fn whole() -> Self {
        Self::default()
    }

    /// Resolve against a buffer of `len` bytes.
    pub fn slice_bounds(&self, len: usize) -> Result<(usize, usize)> {
        let len = len as u64;
        if self.start >= len && !(self.start == 0 && len == 0) {
            return Err(HttpSysError::InvalidParameter("range start beyond fragment"));
        }
        let end = if self.length == 0 {
            len
        } else {
            self.start
                .checked_add(self.length)
                .filter(|end| *end <= len)
                .ok_or(HttpSysError::InvalidParameter("range end beyond fragment"))?
        };
        Ok((self.start as usize, end as usize))
    }
}

#[derive(Debug, Clone)]
struct Fragment {
    data: Arc<[u8]>,
    expires: Option<Instant>,
}

impl Fragment {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
pub struct FragmentCache {
    entries: Mutex<BTreeMap<String, Fragment>>,
}

impl FragmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fragment. An existing live fragment with the same name is
    /// not replaced.
    pub fn add(&self, name: &str, data: impl Into<Arc<[u8]>>, policy: CachePolicy) -> Result<()> {
        if name.is_empty() {
            return Err(HttpSysError::InvalidParameter("fragment name is empty"));
        }
        let key = name.to_ascii_lowercase();
        let now = Instant::now();
        let expires = match policy {
            CachePolicy::UserInvalidates => None,
            CachePolicy::TimeToLive(ttl) => Some(now + ttl),
        };

        let mut entries = lock(&self.entries);
        if entries.get(&key).is_some_and(|f| f.is_live(now)) {
            return Err(HttpSysError::DuplicateTag(key));
        }
        entries.insert(
            key,
            Fragment {
                data: data.into(),
                expires,
            },
        );
        Ok(())
    }

    /// Fetch a live fragment. Expired entries are pruned on the way.
    pub fn find(&self, name: &str) -> Option<Arc<[u8]>> {
        let key = name.to_ascii_lowercase();
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get(&key) {
            Some(fragment) if fragment.is_live(now) => Some(Arc::clone(&fragment.data)),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Copy a range of a fragment into a new buffer no larger than
    /// `buffer_len`, or report the size needed.
    pub fn read(&self, name: &str, range: ByteRange, buffer_len: usize) -> Result<Vec<u8>> {
        let data = self
            .find(name)
            .ok_or_else(|| HttpSysError::NotFound(name.to_ascii_lowercase()))?;
        let (start, end) = range.slice_bounds(data.len())?;
        let required = end - start;
        if buffer_len < required {
            return Err(HttpSysError::MoreData {
                required,
                request: Handle::NULL,
            });
        }
        Ok(data[start..end].to_vec())
    }

    /// Remove `name`, and with `recursive` every key it prefixes.
    pub fn flush(&self, name: &str, recursive: bool) -> Result<usize> {
        let key = name.to_ascii_lowercase();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        if recursive {
            entries.retain(|k, _| !k.starts_with(&key));
        } else {
            entries.remove(&key);
        }
        let erased = before - entries.len();
        if erased == 0 {
            return Err(HttpSysError::NotFound(key));
        }
        tracing::debug!(prefix = %key, recursive, erased, "Fragments flushed");
        Ok(erased)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
