//! Frame codec: the packed 11-bit identifier and the payload layouts.
//!
//! Identifier layout, least-significant bit first:
//!
//! ```norust
//!  2    | 1     | 3     | 3      | 2
//! kind  | query | class | sub-id | endpoint
//! ```
//!
//! Attribute payload layout (little-endian):
//!
//! ```norust
//!  0..2 | 2..6
//!  key  | value (writes and read responses only)
//! ```
//!
//! Error response payload layout:
//!
//! ```norust
//!  0..4            | 4..8
//!  error code, i32 | offending key, u32 (attribute errors only)
//! ```

use crate::Error;
use embedded_can::StandardId;
use modular_bitfield::prelude::*;

/// Maximum payload length of a classic CAN frame.
pub const MAX_LEN: usize = 8;

/// Frame kind, 2 bits.
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
pub enum FrameKind {
    Command = 0b00,
    Telemetry = 0b01,
    WriteAttribute = 0b10,
    ReadAttribute = 0b11,
}

impl FrameKind {
    /// Kind used by the error frame answering a request of this kind.
    ///
    /// Command and telemetry failures are reported as `Command`, attribute
    /// failures as `WriteAttribute`; a response frame of either kind is an
    /// error frame by definition.
    pub const fn error_kind(self) -> FrameKind {
        match self {
            FrameKind::Command | FrameKind::Telemetry => FrameKind::Command,
            FrameKind::WriteAttribute | FrameKind::ReadAttribute => FrameKind::WriteAttribute,
        }
    }
}

/// Direction bit: queries travel controller→device, responses (including
/// telemetry pushes) device→controller.
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
pub enum Direction {
    Response = 0,
    Query = 1,
}

/// Logical destination inside a device, 2 bits.
///
/// Endpoints 0–2 are free application endpoints; endpoint 3 is reserved
/// for board-level control (see [`crate::blc`]).
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
pub enum Endpoint {
    App = 0b00,
    Ep1 = 0b01,
    Ep2 = 0b10,
    BoardControl = 0b11,
}

/// The 11-bit CAN identifier in its packed form.
///
/// This is the one canonical pack/unpack pair; filters and masks in
/// [`crate::filter`] are derived from it rather than re-spelling the
/// layout. The upper 5 bits of the underlying `u16` are reserved and stay
/// zero for any identifier that fits a standard CAN id.
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id {
    #[bits = 2]
    pub kind: FrameKind,
    #[bits = 1]
    pub direction: Direction,
    pub class: B3,
    pub sub_id: B3,
    #[bits = 2]
    pub endpoint: Endpoint,
    pub rfu: B5,
}

impl Id {
    /// True for the all-ones broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.class() == 7 && self.sub_id() == 7
    }
}

impl From<Id> for u16 {
    fn from(id: Id) -> u16 {
        u16::from_le_bytes(id.into_bytes())
    }
}

impl From<u16> for Id {
    fn from(raw: u16) -> Id {
        Id::from_bytes(raw.to_le_bytes())
    }
}

impl From<StandardId> for Id {
    fn from(id: StandardId) -> Id {
        Id::from(id.as_raw())
    }
}

/// An [`Id`] with reserved bits set cannot be represented as a standard
/// CAN identifier.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct ReservedBitsSet;

impl TryFrom<Id> for StandardId {
    type Error = ReservedBitsSet;

    fn try_from(id: Id) -> Result<StandardId, ReservedBitsSet> {
        StandardId::new(u16::from(id)).ok_or(ReservedBitsSet)
    }
}

/// A protocol frame: identifier plus 0..8 payload bytes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    id: Id,
    data: [u8; MAX_LEN],
    len: u8,
}

impl Frame {
    /// Builds a frame from an identifier and payload; payloads longer than
    /// 8 bytes are truncated.
    pub fn new(id: Id, payload: &[u8]) -> Frame {
        let len = payload.len().min(MAX_LEN);
        let mut data = [0u8; MAX_LEN];
        data[..len].copy_from_slice(&payload[..len]);
        Frame {
            id,
            data,
            len: len as u8,
        }
    }

    /// A read-attribute response (also answers writes): key plus 32-bit
    /// value, 6 bytes.
    pub fn attribute_response(id: Id, key: u16, value: u32) -> Frame {
        let mut data = [0u8; MAX_LEN];
        data[0..2].copy_from_slice(&key.to_le_bytes());
        data[2..6].copy_from_slice(&value.to_le_bytes());
        Frame { id, data, len: 6 }
    }

    /// A synthesised read-attribute query, as sent by a controller or the
    /// startup-attribute publisher: key only, 2 bytes.
    pub fn attribute_query(id: Id, key: u16) -> Frame {
        let mut data = [0u8; MAX_LEN];
        data[0..2].copy_from_slice(&key.to_le_bytes());
        Frame { id, data, len: 2 }
    }

    /// An error response. The first word is the negation of the failing
    /// component's result, as computed by the dispatcher: command and
    /// telemetry handlers report C-style negative results, so their error
    /// frames carry the positive code, while the attribute layer reports
    /// positive taxonomy codes and its error frames carry the negative
    /// code. The offending key follows for attribute errors where it was
    /// decoded.
    pub fn error_response(id: Id, code: i32, key: Option<u16>) -> Frame {
        let mut data = [0u8; MAX_LEN];
        data[0..4].copy_from_slice(&code.to_le_bytes());
        let len = match key {
            Some(key) => {
                data[4..8].copy_from_slice(&u32::from(key).to_le_bytes());
                8
            }
            None => 4,
        };
        Frame { id, data, len }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Reads the attribute key from a read/write-attribute payload.
pub fn read_key(data: &[u8]) -> Result<u16, Error> {
    if data.len() < 2 {
        return Err(Error::Frame);
    }
    Ok(u16::from_le_bytes([data[0], data[1]]))
}

/// Reads the 32-bit value from a write-attribute payload.
pub fn read_value(data: &[u8]) -> Result<u32, Error> {
    if data.len() < 6 {
        return Err(Error::Frame);
    }
    Ok(u32::from_le_bytes([data[2], data[3], data[4], data[5]]))
}
