//! Observation tokens.
//!
//! A token correlates a registration request with the notifications pushed
//! for it and with its later cancellation. Tokens are 0-8 opaque bytes on the
//! wire; the client always mints 8 random bytes.

use std::fmt;

/// Maximum token length permitted by the message format.
pub const MAX_TOKEN_LEN: usize = 8;

/// Opaque subscription token (0-8 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LEN],
}

impl Token {
    /// The zero-length token carried by empty messages.
    pub const EMPTY: Token = Token {
        len: 0,
        bytes: [0u8; MAX_TOKEN_LEN],
    };

    /// Mint a fresh 8-byte random token.
    pub fn random() -> Self {
        Self {
            len: MAX_TOKEN_LEN as u8,
            bytes: rand::random(),
        }
    }

    /// Build a token from raw bytes.
    ///
    /// Returns `None` if `raw` is longer than [`MAX_TOKEN_LEN`].
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        if raw.len() > MAX_TOKEN_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_TOKEN_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// Token bytes as carried on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the zero-length token.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}
