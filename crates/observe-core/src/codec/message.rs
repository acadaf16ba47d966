//! Message model and datagram encoding.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::options::{number, CoapOption, Options};
use super::CodecError;
use crate::domain::{Token, MAX_TOKEN_LEN};

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

const PAYLOAD_MARKER: u8 = 0xFF;
const HEADER_LEN: usize = 4;
const MAX_OBSERVE_LEN: usize = 3;

// =============================================================================
// MESSAGE TYPE
// =============================================================================

/// Message-layer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Requires an acknowledgement.
    Confirmable,
    /// Fire-and-forget.
    NonConfirmable,
    /// Acknowledges a confirmable message (may piggy-back a response).
    Acknowledgement,
    /// Rejects a message the receiver cannot process.
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

// =============================================================================
// CODE
// =============================================================================

/// Method or response code, `class.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    /// 0.00 — empty message
    pub const EMPTY: Code = Code::new(0, 0);
    /// 0.01
    pub const GET: Code = Code::new(0, 1);
    /// 2.03
    pub const VALID: Code = Code::new(2, 3);
    /// 2.05
    pub const CONTENT: Code = Code::new(2, 5);
    /// 4.00
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    /// 4.04
    pub const NOT_FOUND: Code = Code::new(4, 4);
    /// 5.00
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    /// Build from class (0-7) and detail (0-31).
    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1F))
    }

    /// Raw byte.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Class digit.
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Detail digits.
    pub const fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// 0.00
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Class 0 other than 0.00.
    pub const fn is_request(self) -> bool {
        self.class() == 0 && self.0 != 0
    }

    /// Classes 2, 4 and 5.
    pub const fn is_response(self) -> bool {
        matches!(self.class(), 2 | 4 | 5)
    }

    /// Class 2.
    pub const fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl From<u8> for Code {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({})", self)
    }
}

/// Observe option values in requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveAction {
    /// Add the client to the observer list.
    Register,
    /// Remove the client from the observer list.
    Deregister,
}

impl ObserveAction {
    fn value(self) -> u32 {
        match self {
            Self::Register => 0,
            Self::Deregister => 1,
        }
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// A single protocol message; one per datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message-layer type
    pub mtype: MessageType,
    /// Method or response code
    pub code: Code,
    /// Message id for deduplication and ACK/RST matching
    pub message_id: u16,
    /// Request/response correlation token
    pub token: Token,
    /// Options, sorted by number
    pub options: Options,
    /// Payload (empty when absent)
    pub payload: Bytes,
}

impl Message {
    /// Bare message with no options or payload.
    pub fn new(mtype: MessageType, code: Code, message_id: u16, token: Token) -> Self {
        Self {
            mtype,
            code,
            message_id,
            token,
            options: Options::new(),
            payload: Bytes::new(),
        }
    }

    /// Confirmable empty message, answered with Reset by a live peer.
    pub fn ping(message_id: u16) -> Self {
        Self::new(MessageType::Confirmable, Code::EMPTY, message_id, Token::EMPTY)
    }

    /// Empty acknowledgement.
    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id, Token::EMPTY)
    }

    /// Reset.
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id, Token::EMPTY)
    }

    /// Confirmable GET carrying an Observe option for `path`.
    pub fn observe_request(message_id: u16, token: Token, path: &str, action: ObserveAction) -> Self {
        let mut msg = Self::new(MessageType::Confirmable, Code::GET, message_id, token);
        msg.options.push_uint(number::OBSERVE, action.value());
        msg.options.set_uri_path(path);
        msg
    }

    /// Builder: set the Observe option.
    pub fn with_observe(mut self, sequence: u32) -> Self {
        self.options.push_uint(number::OBSERVE, sequence);
        self
    }

    /// Builder: set Content-Format.
    pub fn with_content_format(mut self, format: u16) -> Self {
        self.options.push_uint(number::CONTENT_FORMAT, u32::from(format));
        self
    }

    /// Builder: set the payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Observe option value, if present.
    pub fn observe(&self) -> Option<u32> {
        self.options.get_uint(number::OBSERVE)
    }

    /// Content-Format option value, if present.
    pub fn content_format(&self) -> Option<u16> {
        self.options
            .get_uint(number::CONTENT_FORMAT)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Request path from Uri-Path options.
    pub fn uri_path(&self) -> String {
        self.options.uri_path()
    }

    /// True for 0.00 messages (ping, empty ACK, Reset).
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    // =========================================================================
    // ENCODING
    // =========================================================================

    /// Serialize into a datagram.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 16);

        buf.put_u8((PROTOCOL_VERSION << 6) | (self.mtype.bits() << 4) | self.token.len() as u8);
        buf.put_u8(self.code.raw());
        buf.put_u16(self.message_id);
        buf.put_slice(self.token.as_bytes());

        let mut previous = 0u16;
        for option in self.options.iter() {
            encode_option(&mut buf, option, previous)?;
            previous = option.number;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }

    /// Parse a datagram.
    pub fn decode(mut datagram: Bytes) -> Result<Self, CodecError> {
        need(&datagram, HEADER_LEN)?;

        let first = datagram.get_u8();
        let version = first >> 6;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mtype = MessageType::from_bits(first >> 4);
        let token_len = first & 0x0F;
        if usize::from(token_len) > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(token_len));
        }
        let code = Code::from(datagram.get_u8());
        let message_id = datagram.get_u16();

        need(&datagram, usize::from(token_len))?;
        let raw_token = datagram.split_to(usize::from(token_len));
        let token = Token::from_slice(&raw_token).ok_or(CodecError::InvalidTokenLength(token_len))?;

        if code.is_empty() && (token_len != 0 || datagram.has_remaining()) {
            return Err(CodecError::MalformedEmpty);
        }

        let mut options = Options::new();
        let mut payload = Bytes::new();
        let mut number = 0u16;

        while datagram.has_remaining() {
            let head = datagram.get_u8();
            if head == PAYLOAD_MARKER {
                if !datagram.has_remaining() {
                    return Err(CodecError::EmptyPayload);
                }
                payload = datagram.split_off(0);
                break;
            }

            let delta = read_extended(&mut datagram, head >> 4)?;
            let length = read_extended(&mut datagram, head & 0x0F)?;

            number = u16::try_from(u32::from(number) + delta)
                .map_err(|_| CodecError::OptionNumberOverflow)?;
            let length = length as usize;
            need(&datagram, length)?;
            let value = datagram.split_to(length);

            if number == number::OBSERVE && value.len() > MAX_OBSERVE_LEN {
                return Err(CodecError::InvalidObserveValue(value.len()));
            }
            options.push_decoded(CoapOption { number, value });
        }

        Ok(Self {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn need(buf: &Bytes, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}

/// Decode a 4-bit delta/length nibble with its 1- or 2-byte extension.
fn read_extended(buf: &mut Bytes, nibble: u8) -> Result<u32, CodecError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            need(buf, 1)?;
            Ok(u32::from(buf.get_u8()) + 13)
        }
        14 => {
            need(buf, 2)?;
            Ok(u32::from(buf.get_u16()) + 269)
        }
        _ => Err(CodecError::ReservedOptionNibble),
    }
}

/// Split a delta/length value into its nibble and extension bytes.
fn nibble(value: u32) -> (u8, Option<u8>, Option<u16>) {
    match value {
        0..=12 => (value as u8, None, None),
        13..=268 => (13, Some((value - 13) as u8), None),
        _ => (14, None, Some((value - 269) as u16)),
    }
}

fn encode_option(buf: &mut BytesMut, option: &CoapOption, previous: u16) -> Result<(), CodecError> {
    const MAX_EXTENDED: usize = 269 + u16::MAX as usize;

    if option.value.len() > MAX_EXTENDED {
        return Err(CodecError::OptionTooLong(option.value.len()));
    }
    let delta = u32::from(option.number - previous);
    let (delta_nibble, delta_ext8, delta_ext16) = nibble(delta);
    let (len_nibble, len_ext8, len_ext16) = nibble(option.value.len() as u32);

    buf.put_u8((delta_nibble << 4) | len_nibble);
    if let Some(b) = delta_ext8 {
        buf.put_u8(b);
    }
    if let Some(w) = delta_ext16 {
        buf.put_u16(w);
    }
    if let Some(b) = len_ext8 {
        buf.put_u8(b);
    }
    if let Some(w) = len_ext16 {
        buf.put_u16(w);
    }
    buf.put_slice(&option.value);
    Ok(())
}
