use std::fmt;
use thiserror::Error;

/// Number of payload bytes every stored frame carries, regardless of its DLC.
pub const PAYLOAD_CAPACITY: usize = 8;

/// Minimum number of hex digits in the wire form of an identifier.
const MIN_WIRE_ID_DIGITS: usize = 3;

/// Maximum number of significant hex digits an identifier may carry (29-bit extended IDs fit).
const MAX_WIRE_ID_DIGITS: usize = 8;

/// Errors raised when constructing a [`Frame`] from untrusted parts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame identifier is empty")]
    EmptyIdentifier,
    #[error("Frame identifier '{0}' is not a hexadecimal value of at most 8 significant digits")]
    InvalidIdentifier(String),
    #[error("Declared length {0} exceeds the maximum DLC of 8")]
    LengthOutOfRange(u8),
    #[error("{0} payload bytes supplied, a frame stores at most 8")]
    TooManyBytes(usize),
}

/// One observed or synthesized CAN frame.
///
/// The identifier is kept exactly as observed (uppercased, leading zeros intact) so that
/// lookups match the trace. `length` is the declared DLC; only the first `length` payload
/// bytes go on the wire, the rest is zero padding or trailing trace bytes kept for
/// uniform storage.
///
/// Fields are private: identifier and length are fixed once a frame exists, and only
/// the payload can be adjusted from inside the crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    identifier: String,
    length: u8,
    payload: [u8; PAYLOAD_CAPACITY],
}

impl Frame {
    /// Builds a frame, uppercasing the identifier and right-padding `bytes` with zeros.
    ///
    /// `bytes` may be longer than `length` (trace records sometimes carry trailing bytes),
    /// but never longer than [`PAYLOAD_CAPACITY`].
    pub fn new(identifier: &str, length: u8, bytes: &[u8]) -> Result<Self, FrameError> {
        let identifier = normalize_identifier(identifier)?;
        if length as usize > PAYLOAD_CAPACITY {
            return Err(FrameError::LengthOutOfRange(length));
        }
        if bytes.len() > PAYLOAD_CAPACITY {
            return Err(FrameError::TooManyBytes(bytes.len()));
        }
        let mut payload = [0u8; PAYLOAD_CAPACITY];
        payload[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            identifier,
            length,
            payload,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    /// All eight stored bytes, including the padding beyond `length`.
    pub fn payload(&self) -> &[u8; PAYLOAD_CAPACITY] {
        &self.payload
    }

    /// The bytes that are actually transmitted.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.length as usize]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8; PAYLOAD_CAPACITY] {
        &mut self.payload
    }

    /// Identifier in wire form: leading zeros stripped, then re-padded to at least 3 digits.
    pub fn wire_id(&self) -> String {
        let trimmed = self.identifier.trim_start_matches('0');
        let significant = if trimmed.is_empty() { "0" } else { trimmed };
        format!("{significant:0>width$}", width = MIN_WIRE_ID_DIGITS)
    }

    /// Uppercase hex of the transmitted bytes with no separators.
    pub fn payload_hex(&self) -> String {
        self.data().iter().map(|b| format!("{b:02X}")).collect()
    }

    /// The `ID#HEXDATA` string handed to the transmission primitive.
    pub fn to_wire(&self) -> String {
        format!("{}#{}", self.wire_id(), self.payload_hex())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID={} DLC={} DATA={}",
            self.identifier,
            self.length,
            self.payload_hex()
        )
    }
}

/// Uppercases and validates a raw identifier token without touching its leading zeros.
pub fn normalize_identifier(raw: &str) -> Result<String, FrameError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FrameError::EmptyIdentifier);
    }
    let significant = trimmed.trim_start_matches('0');
    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) || significant.len() > MAX_WIRE_ID_DIGITS
    {
        return Err(FrameError::InvalidIdentifier(trimmed.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Numeric value of a normalized identifier, used for ordering identifier listings.
pub fn identifier_value(identifier: &str) -> Option<u32> {
    let significant = identifier.trim_start_matches('0');
    if significant.is_empty() {
        return Some(0);
    }
    u32::from_str_radix(significant, 16).ok()
}
