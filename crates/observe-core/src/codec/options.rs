//! Message options.

use bytes::Bytes;

/// Option numbers used by the client.
pub mod number {
    /// Observe (RFC 7641)
    pub const OBSERVE: u16 = 6;
    /// Uri-Path, one option per segment
    pub const URI_PATH: u16 = 11;
    /// Content-Format
    pub const CONTENT_FORMAT: u16 = 12;
}

/// One option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number
    pub number: u16,
    /// Raw value
    pub value: Bytes,
}

/// Options of a message, kept sorted by number (insertion order among
/// equal numbers is preserved, which matters for repeated Uri-Path).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<CoapOption>);

impl Options {
    /// No options.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append an option after any existing options with the same number.
    pub fn push(&mut self, number: u16, value: impl Into<Bytes>) {
        let at = self.0.partition_point(|o| o.number <= number);
        self.0.insert(
            at,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    /// Append an unsigned integer option in minimal big-endian form.
    pub fn push_uint(&mut self, number: u16, value: u32) {
        self.push(number, encode_uint(value));
    }

    /// First value for `number`.
    pub fn get(&self, number: u16) -> Option<&Bytes> {
        self.0.iter().find(|o| o.number == number).map(|o| &o.value)
    }

    /// All values for `number`, in order.
    pub fn get_all(&self, number: u16) -> impl Iterator<Item = &Bytes> {
        self.0.iter().filter(move |o| o.number == number).map(|o| &o.value)
    }

    /// First value for `number` decoded as an unsigned integer.
    pub fn get_uint(&self, number: u16) -> Option<u32> {
        self.get(number).and_then(|v| decode_uint(v))
    }

    /// Set Uri-Path options from a `/`-separated path.
    pub fn set_uri_path(&mut self, path: &str) {
        self.0.retain(|o| o.number != number::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.push(number::URI_PATH, Bytes::copy_from_slice(segment.as_bytes()));
        }
    }

    /// Uri-Path options joined back into `/a/b` form.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for segment in self.get_all(number::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Iterate in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &CoapOption> {
        self.0.iter()
    }

    /// Number of option instances.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no options.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(super) fn push_decoded(&mut self, option: CoapOption) {
        // Decoding sees options in ascending order already.
        self.0.push(option);
    }
}

/// Minimal big-endian encoding; zero is the empty string.
pub(super) fn encode_uint(value: u32) -> Bytes {
    let be = value.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    Bytes::copy_from_slice(&be[skip..])
}

pub(super) fn decode_uint(raw: &[u8]) -> Option<u32> {
    if raw.len() > 4 {
        return None;
    }
    Some(raw.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}
