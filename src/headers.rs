//! Header Map

use std::{cell::RefCell, rc::Rc};

use crate::error::HeaderError;

/// Case-insensitive ordered multimap of header name to values, as delivered
/// by the proxy. Names and values are byte strings; values need not be
/// valid UTF-8.
pub trait HeaderMap {
    /// First value for the name, or `None`.
    fn get(&self, name: &[u8]) -> Option<Vec<u8>>;

    /// Append a header.
    fn add(&mut self, name: &[u8], value: &[u8]) -> Result<(), HeaderError>;

    /// Remove every header with the name.
    fn remove(&mut self, name: &[u8]);

    /// Snapshot of all headers in map order.
    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)>;
}

pub type SharedHeaderMap = Rc<RefCell<dyn HeaderMap>>;

/// Reference [`HeaderMap`] implementation. Keeps insertion order, lowercases
/// names on insert and accepts pseudo-headers such as `:path`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteHeaderMap {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ByteHeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.entries
            .push((name.as_ref().to_ascii_lowercase(), value.as_ref().to_vec()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl HeaderMap for ByteHeaderMap {
    fn get(&self, name: &[u8]) -> Option<Vec<u8>> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    fn add(&mut self, name: &[u8], value: &[u8]) -> Result<(), HeaderError> {
        if name.is_empty() {
            return Err(HeaderError::InvalidName);
        }
        self.append(name, value);
        Ok(())
    }

    fn remove(&mut self, name: &[u8]) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries.clone()
    }
}

/// Interop for proxies that keep their headers in `http` types. Pseudo
/// headers are rejected by `http`'s own name validation.
impl HeaderMap for http::HeaderMap {
    fn get(&self, name: &[u8]) -> Option<Vec<u8>> {
        let name = std::str::from_utf8(name).ok()?;
        http::HeaderMap::get(self, name).map(|v| v.as_bytes().to_vec())
    }

    fn add(&mut self, name: &[u8], value: &[u8]) -> Result<(), HeaderError> {
        let name =
            http::header::HeaderName::from_bytes(name).map_err(|_| HeaderError::InvalidName)?;
        let value =
            http::header::HeaderValue::from_bytes(value).map_err(|_| HeaderError::InvalidValue)?;
        self.append(name, value);
        Ok(())
    }

    fn remove(&mut self, name: &[u8]) {
        if let Ok(name) = http::header::HeaderName::from_bytes(name) {
            while http::HeaderMap::remove(self, &name).is_some() {}
        }
    }

    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.iter()
            .map(|(n, v)| (n.as_str().as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }
}
