//! CANIOT device-side protocol core.
//!
//! Supports `no_std`.
//!
//! CANIOT is an application-layer protocol carried over classic CAN with
//! 11-bit identifiers, used to build small sensor/actuator networks. Every
//! node is addressed by a 6-bit device identifier (a 3-bit class plus a
//! 3-bit sub-id), and every frame is one of four kinds: command, telemetry,
//! attribute read, attribute write. This crate implements the device side:
//!
//!  - decoding and classifying inbound frames ([`frame`], [`filter`])
//!  - the declarative attribute catalogue and key resolution ([`schema`],
//!    [`attr`])
//!  - the attribute engine, request dispatcher and cooperative device loop
//!    ([`device`])
//!  - board-level control and temperature wire codecs ([`blc`],
//!    [`datatype`])
//!
//! The physical CAN driver, command execution and telemetry contents are
//! application concerns, reached through the [`device::Driver`] and
//! [`device::Application`] traits.

#![no_std]

pub mod attr;
pub mod blc;
pub mod datatype;
pub mod device;
pub mod filter;
pub mod frame;
pub mod schema;
pub mod state;

pub use device::{Application, Device, Driver, ProcessError, Timestamp};
pub use frame::{Direction, Endpoint, Frame, FrameKind, Id};
pub use state::{Config, ConfigFlags, Identification, SystemState};

/// 6-bit device identifier: 3-bit class plus 3-bit sub-id.
///
/// `(class = 7, sub-id = 7)` is the broadcast address. A device's own
/// identifier must keep both fields below 7; [`Device::new`] enforces
/// this.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    class: u8,
    sub_id: u8,
}

impl DeviceId {
    /// The all-ones broadcast address.
    pub const BROADCAST: DeviceId = DeviceId {
        class: 7,
        sub_id: 7,
    };

    /// Builds an identifier, rejecting fields that do not fit in 3 bits.
    pub const fn new(class: u8, sub_id: u8) -> Option<DeviceId> {
        if class < 8 && sub_id < 8 {
            Some(DeviceId { class, sub_id })
        } else {
            None
        }
    }

    /// Decodes the packed form `(class << 3) | sub_id`; the two high bits
    /// of the byte are ignored.
    pub const fn from_raw(raw: u8) -> DeviceId {
        DeviceId {
            class: (raw >> 3) & 0x7,
            sub_id: raw & 0x7,
        }
    }

    /// Packed form `(class << 3) | sub_id`.
    pub const fn raw(self) -> u8 {
        (self.class << 3) | self.sub_id
    }

    pub const fn class(self) -> u8 {
        self.class
    }

    pub const fn sub_id(self) -> u8 {
        self.sub_id
    }

    pub const fn is_broadcast(self) -> bool {
        self.class == 7 && self.sub_id == 7
    }
}

/// Protocol error taxonomy.
///
/// Codes live in a dedicated base range (`0x3A00`) so hosts can tell
/// protocol failures apart from transport failures. An error frame's
/// first word is the negation of the failing component's result
/// ([`frame::Frame::error_response`]): command/telemetry handlers report
/// the C-style negated form (see [`Error::errno`]), so their error
/// frames carry the positive code, while the attribute layer reports
/// positive taxonomy codes, so attribute error frames carry the negative
/// code. Device-local storage (`last_command_error`,
/// `last_telemetry_error`) always keeps the negated form.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Error {
    /// Malformed request (e.g. a frame with the response direction bit).
    Invalid = 0x3A01,
    /// Payload too short for its frame kind.
    Frame = 0x3A02,
    /// Attribute key names a section that does not exist.
    KeySection = 0x3A03,
    /// Attribute key names an attribute outside its section.
    KeyAttribute = 0x3A04,
    /// Attribute key selects a 4-byte part past the end of the attribute.
    KeyPart = 0x3A05,
    /// Attribute is restricted to another device class.
    ClassAttribute = 0x3A06,
    /// No such attribute (custom-attribute miss).
    NoAttribute = 0x3A07,
    /// Attribute cannot be read.
    AttributeRead = 0x3A08,
    /// Attribute write failed.
    AttributeWrite = 0x3A09,
    /// Attribute is read-only.
    ReadOnlyAttribute = 0x3A0A,
    /// No command handler installed, or the handler failed.
    CommandHandler = 0x3A0B,
    /// No telemetry handler installed, or the handler failed.
    TelemetryHandler = 0x3A0C,
    /// Frame does not target this device.
    Unexpected = 0x3A0D,
    /// Nothing pending; not a protocol failure.
    Again = 0x3A0E,
    /// Operation not supported by this device.
    NotSupported = 0x3A0F,
    /// Operation recognised but not implemented.
    NotImplemented = 0x3A10,
}

impl Error {
    /// Stable numeric code.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// C-style negated return value, as stored in the system section's
    /// `last_command_error` / `last_telemetry_error` attributes.
    pub const fn errno(self) -> i32 {
        -(self as u16 as i32)
    }

    /// Inverse of [`Error::code`], for controller-side decoding of error
    /// frames.
    pub const fn from_code(code: u16) -> Option<Error> {
        Some(match code {
            0x3A01 => Error::Invalid,
            0x3A02 => Error::Frame,
            0x3A03 => Error::KeySection,
            0x3A04 => Error::KeyAttribute,
            0x3A05 => Error::KeyPart,
            0x3A06 => Error::ClassAttribute,
            0x3A07 => Error::NoAttribute,
            0x3A08 => Error::AttributeRead,
            0x3A09 => Error::AttributeWrite,
            0x3A0A => Error::ReadOnlyAttribute,
            0x3A0B => Error::CommandHandler,
            0x3A0C => Error::TelemetryHandler,
            0x3A0D => Error::Unexpected,
            0x3A0E => Error::Again,
            0x3A0F => Error::NotSupported,
            0x3A10 => Error::NotImplemented,
            _ => return None,
        })
    }
}
