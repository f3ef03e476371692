//! The attribute catalogue: three sections of statically-declared
//! attributes, each with an offset into its section's byte store, a size,
//! role flags and an optional class restriction.
//!
//! The tables are read-only and shared by every device instance; the byte
//! layouts they describe are implemented by the stores in [`crate::state`]
//! through the offset constants below.

use bitflags::bitflags;

bitflags! {
    /// Per-attribute role flags.
    ///
    /// `HIDDEN` entries stay in the catalogue (iteration still visits
    /// them) but lose both access rights during resolution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleFlags: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const HIDDEN = 1 << 2;
    }
}

const R: RoleFlags = RoleFlags::READABLE;
const RW: RoleFlags = RoleFlags::READABLE.union(RoleFlags::WRITABLE);

/// Restricts an attribute to devices of one class.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassRestriction {
    Any,
    Only(u8),
}

/// How writes to a section behave.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionRole {
    /// Writes are refused regardless of per-attribute flags.
    ReadOnly,
    /// Writes land in RAM only.
    Volatile,
    /// Writes are surfaced to the application for persistence.
    Persistent,
}

/// Section index inside an attribute key.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Identification = 0,
    System = 1,
    Configuration = 2,
}

/// One catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrSpec {
    /// Byte offset of the attribute inside its section store.
    pub offset: usize,
    /// Attribute size in bytes. Attributes larger than 4 bytes are
    /// addressed in 4-byte parts.
    pub size: usize,
    pub flags: RoleFlags,
    pub class: ClassRestriction,
}

/// One section: its write role and its ordered attributes. The position
/// of an entry in `attributes` is its attribute index in the key.
#[derive(Debug, Clone, Copy)]
pub struct SectionSpec {
    pub role: SectionRole,
    pub attributes: &'static [AttrSpec],
}

const fn attr(offset: usize, size: usize, flags: RoleFlags) -> AttrSpec {
    AttrSpec {
        offset,
        size,
        flags,
        class: ClassRestriction::Any,
    }
}

const fn class_attr(class: u8, offset: usize, size: usize, flags: RoleFlags) -> AttrSpec {
    AttrSpec {
        offset,
        size,
        flags,
        class: ClassRestriction::Only(class),
    }
}

/// Byte layout of the identification store.
pub mod ident {
    pub const DID: usize = 0;
    pub const VERSION: usize = 1;
    pub const NAME: usize = 3;
    pub const NAME_LEN: usize = 32;
    pub const MAGIC: usize = 35;
    pub const BUILD_DATE: usize = 39;
    pub const BUILD_DATE_LEN: usize = 12;
    pub const BUILD_COMMIT: usize = 51;
    pub const BUILD_COMMIT_LEN: usize = 20;
    pub const FEATURES: usize = 71;
    pub const FEATURES_LEN: usize = 16;
    pub const LEN: usize = 87;
}

/// Byte layout of the system store.
pub mod system {
    pub const UPTIME_SYNCED: usize = 0;
    pub const TIME: usize = 4;
    pub const UPTIME: usize = 8;
    pub const START_TIME: usize = 12;
    pub const LAST_TELEMETRY: usize = 16;
    pub const RX_TOTAL: usize = 20;
    pub const RX_READ_ATTRIBUTE: usize = 24;
    pub const RX_WRITE_ATTRIBUTE: usize = 28;
    pub const RX_COMMAND: usize = 32;
    pub const RX_REQUEST_TELEMETRY: usize = 36;
    pub const RX_IGNORED: usize = 40;
    pub const TX_TOTAL: usize = 44;
    pub const TX_TELEMETRY: usize = 48;
    pub const LAST_COMMAND_ERROR: usize = 52;
    pub const LAST_TELEMETRY_ERROR: usize = 56;
    pub const BATTERY: usize = 60;
    pub const LEN: usize = 61;

    /// Key of the wall-clock time attribute, whose write re-bases every
    /// deadline the device tracks.
    pub const TIME_KEY: u16 = 0x1010;
}

/// Byte layout of the configuration store.
pub mod config {
    pub const TELEMETRY_PERIOD: usize = 0;
    pub const TELEMETRY_DELAY_MIN: usize = 4;
    pub const TELEMETRY_DELAY_MAX: usize = 8;
    pub const FLAGS: usize = 12;
    pub const TIMEZONE: usize = 16;
    pub const LOCATION: usize = 20;
    pub const LOCATION_LEN: usize = 4;
    pub const C0_PULSE_DURATIONS: usize = 24;
    pub const C0_DIRECTIONS: usize = 56;
    pub const C0_OUTPUTS_DEFAULT: usize = 60;
    pub const C0_TELEMETRY_ON_CHANGE: usize = 64;
    pub const C1_PULSE_DURATIONS: usize = 68;
    pub const C1_DIRECTIONS: usize = 100;
    pub const C1_OUTPUTS_DEFAULT: usize = 104;
    pub const C1_TELEMETRY_ON_CHANGE: usize = 108;
    pub const LEN: usize = 112;

    pub const PULSE_DURATIONS_LEN: usize = 32;
    pub const GPIO_BLOCK_LEN: usize = 44;
}

static IDENTIFICATION: &[AttrSpec] = &[
    attr(ident::DID, 1, R),
    attr(ident::VERSION, 2, R),
    attr(ident::NAME, ident::NAME_LEN, R),
    attr(ident::MAGIC, 4, R),
    attr(ident::BUILD_DATE, ident::BUILD_DATE_LEN, R),
    attr(
        ident::BUILD_COMMIT,
        ident::BUILD_COMMIT_LEN,
        R.union(RoleFlags::HIDDEN),
    ),
    attr(ident::FEATURES, ident::FEATURES_LEN, R),
];

static SYSTEM: &[AttrSpec] = &[
    attr(system::UPTIME_SYNCED, 4, R),
    attr(system::TIME, 4, RW),
    attr(system::UPTIME, 4, R),
    attr(system::START_TIME, 4, R),
    attr(system::LAST_TELEMETRY, 4, R),
    attr(system::RX_TOTAL, 4, R),
    attr(system::RX_READ_ATTRIBUTE, 4, R),
    attr(system::RX_WRITE_ATTRIBUTE, 4, R),
    attr(system::RX_COMMAND, 4, R),
    attr(system::RX_REQUEST_TELEMETRY, 4, R),
    attr(system::RX_IGNORED, 4, R),
    attr(system::TX_TOTAL, 4, R),
    attr(system::TX_TELEMETRY, 4, R),
    attr(system::LAST_COMMAND_ERROR, 4, R),
    attr(system::LAST_TELEMETRY_ERROR, 4, R),
    attr(system::BATTERY, 1, R),
];

static CONFIGURATION: &[AttrSpec] = &[
    attr(config::TELEMETRY_PERIOD, 4, RW),
    attr(config::TELEMETRY_DELAY_MIN, 4, RW),
    attr(config::TELEMETRY_DELAY_MAX, 4, RW),
    attr(config::FLAGS, 4, RW),
    attr(config::TIMEZONE, 4, RW),
    attr(config::LOCATION, config::LOCATION_LEN, RW),
    class_attr(0, config::C0_PULSE_DURATIONS, config::PULSE_DURATIONS_LEN, RW),
    class_attr(0, config::C0_DIRECTIONS, 4, RW),
    class_attr(0, config::C0_OUTPUTS_DEFAULT, 4, RW),
    class_attr(0, config::C0_TELEMETRY_ON_CHANGE, 4, RW),
    class_attr(1, config::C1_PULSE_DURATIONS, config::PULSE_DURATIONS_LEN, RW),
    class_attr(1, config::C1_DIRECTIONS, 4, RW),
    class_attr(1, config::C1_OUTPUTS_DEFAULT, 4, RW),
    class_attr(1, config::C1_TELEMETRY_ON_CHANGE, 4, RW),
];

/// The three sections, indexed by [`SectionId`].
pub static SECTIONS: [SectionSpec; 3] = [
    SectionSpec {
        role: SectionRole::ReadOnly,
        attributes: IDENTIFICATION,
    },
    SectionSpec {
        role: SectionRole::Volatile,
        attributes: SYSTEM,
    },
    SectionSpec {
        role: SectionRole::Persistent,
        attributes: CONFIGURATION,
    },
];

impl SectionId {
    pub const fn from_index(index: u8) -> Option<SectionId> {
        Some(match index {
            0 => SectionId::Identification,
            1 => SectionId::System,
            2 => SectionId::Configuration,
            _ => return None,
        })
    }

    pub const fn index(self) -> u8 {
        self as u8
    }

    pub fn spec(self) -> &'static SectionSpec {
        &SECTIONS[self as usize]
    }
}
