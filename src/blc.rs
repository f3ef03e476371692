//! Board-level control: wire codecs for the fixed endpoint 3 surface.
//!
//! A full-length (8-byte) command frame on the board-control endpoint
//! carries a [`SystemCommand`] in its last byte; the leading bytes are
//! the class-specific command block (e.g. [`Class0Command`]).

use modular_bitfield::prelude::*;

/// Two-state output command, 2 bits.
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
pub enum TwoState {
    None = 0b00,
    On = 0b01,
    Off = 0b10,
    Toggle = 0b11,
}

/// Watchdog and reset requests, one byte.
///
/// Decoding then re-encoding any byte yields that byte back; reserved
/// bits are carried through untouched.
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemCommand {
    pub hardware_reset: bool,
    pub software_reset: bool,
    pub watchdog_reset: bool,
    #[bits = 2]
    pub watchdog: TwoState,
    pub config_reset: bool,
    pub rfu: B2,
}

impl SystemCommand {
    /// An all-zero command requests nothing and is never dispatched to
    /// the application.
    pub fn is_noop(&self) -> bool {
        self.into_bytes()[0] == 0
    }
}

/// Class-0 command block: two open-collector outputs and two relays,
/// one byte.
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Class0Command {
    #[bits = 2]
    pub oc1: TwoState,
    #[bits = 2]
    pub oc2: TwoState,
    #[bits = 2]
    pub rl1: TwoState,
    #[bits = 2]
    pub rl2: TwoState,
}

/// Class-0 telemetry block, 8 bytes: digital I/O states plus one
/// on-board and three external temperatures in the T10 encoding.
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Class0Telemetry {
    pub dio: B8,
    pub pdio: B4,
    pub int_temp: B10,
    pub ext_temp0: B10,
    pub ext_temp1: B10,
    pub ext_temp2: B10,
    pub rfu: B12,
}

/// Heater mode, 3 bits.
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
pub enum HeatingMode {
    None = 0,
    Comfort = 1,
    ComfortMin1 = 2,
    ComfortMin2 = 3,
    EnergySaving = 4,
    FrostFree = 5,
    Off = 6,
    Reserved = 7,
}

/// Command block for a four-heater controller, 2 bytes.
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeatingCommand {
    #[bits = 3]
    pub h1: HeatingMode,
    #[bits = 3]
    pub h2: HeatingMode,
    #[bits = 3]
    pub h3: HeatingMode,
    #[bits = 3]
    pub h4: HeatingMode,
    pub rfu: B4,
}

/// Requested shutter openness: percent open, or [`SHUTTER_UNCHANGED`] to
/// leave a shutter where it is.
pub const SHUTTER_UNCHANGED: u8 = 0xFF;

/// Command block for a four-shutter controller, 4 bytes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutterCommand {
    positions: [u8; 4],
}

impl Default for ShutterCommand {
    fn default() -> ShutterCommand {
        ShutterCommand::new()
    }
}

impl ShutterCommand {
    /// All shutters left unchanged.
    pub fn new() -> ShutterCommand {
        ShutterCommand {
            positions: [SHUTTER_UNCHANGED; 4],
        }
    }

    pub fn from_bytes(positions: [u8; 4]) -> ShutterCommand {
        ShutterCommand { positions }
    }

    pub fn into_bytes(self) -> [u8; 4] {
        self.positions
    }

    /// Requested openness of shutter `index`, `None` when unchanged.
    pub fn position(&self, index: usize) -> Option<u8> {
        match self.positions.get(index) {
            Some(&SHUTTER_UNCHANGED) | None => None,
            Some(&p) => Some(p),
        }
    }

    /// Requests `percent` (clamped to 100) openness for shutter `index`.
    pub fn set_position(&mut self, index: usize, percent: u8) {
        if let Some(slot) = self.positions.get_mut(index) {
            *slot = percent.min(100);
        }
    }
}
