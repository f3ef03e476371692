//! Backing stores for the three attribute sections.
//!
//! Each store wraps a fixed byte array laid out per the offset constants
//! in [`crate::schema`]; the attribute engine moves little-endian windows
//! in and out of these arrays at resolved offsets, and the typed
//! accessors below read and write the same bytes.

use crate::frame::Endpoint;
use crate::schema::{config, ident, system};
use crate::DeviceId;
use modular_bitfield::prelude::*;

pub(crate) fn read_le(bytes: &[u8], offset: usize, size: usize) -> u32 {
    let mut value = 0u32;
    for (i, byte) in bytes[offset..offset + size].iter().enumerate() {
        value |= u32::from(*byte) << (8 * i);
    }
    value
}

pub(crate) fn write_le(bytes: &mut [u8], offset: usize, size: usize, value: u32) {
    for (i, byte) in bytes[offset..offset + size].iter_mut().enumerate() {
        *byte = (value >> (8 * i)) as u8;
    }
}

/// The identification section: immutable device identity, fixed at
/// construction time so it can live in a `static`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    bytes: [u8; ident::LEN],
}

impl Identification {
    /// Builds the identity block. `name` must be at most 32 bytes; the
    /// remainder is zero-padded.
    pub const fn new(did: DeviceId, version: u16, name: &str, magic: u32) -> Identification {
        let mut bytes = [0u8; ident::LEN];
        bytes[ident::DID] = did.raw();
        let version = version.to_le_bytes();
        bytes[ident::VERSION] = version[0];
        bytes[ident::VERSION + 1] = version[1];
        let name = name.as_bytes();
        assert!(name.len() <= ident::NAME_LEN);
        let mut i = 0;
        while i < name.len() {
            bytes[ident::NAME + i] = name[i];
            i += 1;
        }
        let magic = magic.to_le_bytes();
        let mut i = 0;
        while i < 4 {
            bytes[ident::MAGIC + i] = magic[i];
            i += 1;
        }
        Identification { bytes }
    }

    /// Records a build date string, at most 12 bytes.
    pub const fn with_build_date(mut self, date: &str) -> Identification {
        let date = date.as_bytes();
        assert!(date.len() <= ident::BUILD_DATE_LEN);
        let mut i = 0;
        while i < date.len() {
            self.bytes[ident::BUILD_DATE + i] = date[i];
            i += 1;
        }
        self
    }

    /// Records the 20-byte VCS commit hash of the build.
    pub const fn with_build_commit(mut self, commit: [u8; ident::BUILD_COMMIT_LEN]) -> Identification {
        let mut i = 0;
        while i < ident::BUILD_COMMIT_LEN {
            self.bytes[ident::BUILD_COMMIT + i] = commit[i];
            i += 1;
        }
        self
    }

    /// Records the four feature words.
    pub const fn with_features(mut self, features: [u32; 4]) -> Identification {
        let mut word = 0;
        while word < 4 {
            let le = features[word].to_le_bytes();
            let mut i = 0;
            while i < 4 {
                self.bytes[ident::FEATURES + word * 4 + i] = le[i];
                i += 1;
            }
            word += 1;
        }
        self
    }

    pub fn did(&self) -> DeviceId {
        DeviceId::from_raw(self.bytes[ident::DID])
    }

    pub fn version(&self) -> u16 {
        read_le(&self.bytes, ident::VERSION, 2) as u16
    }

    /// Zero-padded device name.
    pub fn name(&self) -> &[u8] {
        &self.bytes[ident::NAME..ident::NAME + ident::NAME_LEN]
    }

    pub fn magic(&self) -> u32 {
        read_le(&self.bytes, ident::MAGIC, 4)
    }

    pub(crate) fn read(&self, offset: usize, size: usize) -> u32 {
        read_le(&self.bytes, offset, size)
    }
}

/// The system section: live counters, times and last errors. Zeroed at
/// device construction; mutated only by the protocol core.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct SystemState {
    bytes: [u8; system::LEN],
}

impl Default for SystemState {
    fn default() -> SystemState {
        SystemState {
            bytes: [0u8; system::LEN],
        }
    }
}

macro_rules! u32_accessor {
    ($(#[$meta:meta])* $get:ident, $set:ident, $offset:expr) => {
        $(#[$meta])*
        pub fn $get(&self) -> u32 {
            read_le(&self.bytes, $offset, 4)
        }

        pub(crate) fn $set(&mut self, value: u32) {
            write_le(&mut self.bytes, $offset, 4, value);
        }
    };
}

macro_rules! counter {
    ($get:ident, $bump:ident, $offset:expr) => {
        pub fn $get(&self) -> u32 {
            read_le(&self.bytes, $offset, 4)
        }

        pub(crate) fn $bump(&mut self) {
            let next = self.$get().wrapping_add(1);
            write_le(&mut self.bytes, $offset, 4, next);
        }
    };
}

impl SystemState {
    pub fn new() -> SystemState {
        SystemState::default()
    }

    u32_accessor!(
        /// Uptime at the moment the wall clock was last synchronised.
        uptime_synced, set_uptime_synced, system::UPTIME_SYNCED);
    u32_accessor!(
        /// Wall-clock seconds, refreshed on every `process()`.
        time, set_time, system::TIME);
    u32_accessor!(uptime, set_uptime, system::UPTIME);
    u32_accessor!(start_time, set_start_time, system::START_TIME);
    u32_accessor!(
        /// Wall-clock second of the last periodic telemetry emission.
        last_telemetry, set_last_telemetry, system::LAST_TELEMETRY);

    counter!(rx_total, bump_rx_total, system::RX_TOTAL);
    counter!(rx_read_attribute, bump_rx_read_attribute, system::RX_READ_ATTRIBUTE);
    counter!(rx_write_attribute, bump_rx_write_attribute, system::RX_WRITE_ATTRIBUTE);
    counter!(rx_command, bump_rx_command, system::RX_COMMAND);
    counter!(rx_request_telemetry, bump_rx_request_telemetry, system::RX_REQUEST_TELEMETRY);
    counter!(rx_ignored, bump_rx_ignored, system::RX_IGNORED);
    counter!(tx_total, bump_tx_total, system::TX_TOTAL);
    counter!(tx_telemetry, bump_tx_telemetry, system::TX_TELEMETRY);

    pub fn last_command_error(&self) -> i32 {
        read_le(&self.bytes, system::LAST_COMMAND_ERROR, 4) as i32
    }

    pub(crate) fn set_last_command_error(&mut self, errno: i32) {
        write_le(&mut self.bytes, system::LAST_COMMAND_ERROR, 4, errno as u32);
    }

    pub fn last_telemetry_error(&self) -> i32 {
        read_le(&self.bytes, system::LAST_TELEMETRY_ERROR, 4) as i32
    }

    pub(crate) fn set_last_telemetry_error(&mut self, errno: i32) {
        write_le(&mut self.bytes, system::LAST_TELEMETRY_ERROR, 4, errno as u32);
    }

    pub fn battery(&self) -> u8 {
        self.bytes[system::BATTERY]
    }

    /// Battery level is application-sampled; everything else in this
    /// section is owned by the core.
    pub fn set_battery(&mut self, level: u8) {
        self.bytes[system::BATTERY] = level;
    }

    pub(crate) fn read(&self, offset: usize, size: usize) -> u32 {
        read_le(&self.bytes, offset, size)
    }

    pub(crate) fn write(&mut self, offset: usize, size: usize, value: u32) {
        write_le(&mut self.bytes, offset, size, value);
    }
}

/// Configuration flag word (attribute key `0x2030`).
#[bitfield]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigFlags {
    /// Emit error frames on request failure; silent when clear.
    pub error_response: bool,
    /// Enable the periodic telemetry trigger.
    pub telemetry_periodic: bool,
    /// Endpoint the periodic trigger requests telemetry on.
    #[bits = 2]
    pub telemetry_endpoint: Endpoint,
    pub rfu: B28,
}

/// The configuration section: application-owned tunables, persisted
/// through [`crate::device::Application::config_write`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    bytes: [u8; config::LEN],
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl Config {
    /// Factory defaults: telemetry every 60 s on the board-control
    /// endpoint, error responses enabled, no broadcast delay spread
    /// beyond 100 ms.
    pub fn new() -> Config {
        let mut cfg = Config {
            bytes: [0u8; config::LEN],
        };
        cfg.set_telemetry_period(60_000);
        cfg.set_telemetry_delay_max(100);
        cfg.set_flags(
            ConfigFlags::new()
                .with_error_response(true)
                .with_telemetry_periodic(true)
                .with_telemetry_endpoint(Endpoint::BoardControl),
        );
        cfg
    }

    /// Telemetry period in milliseconds.
    pub fn telemetry_period(&self) -> u32 {
        read_le(&self.bytes, config::TELEMETRY_PERIOD, 4)
    }

    pub fn set_telemetry_period(&mut self, millis: u32) {
        write_le(&mut self.bytes, config::TELEMETRY_PERIOD, 4, millis);
    }

    /// Lower bound of the broadcast response delay, milliseconds.
    pub fn telemetry_delay_min(&self) -> u32 {
        read_le(&self.bytes, config::TELEMETRY_DELAY_MIN, 4)
    }

    pub fn set_telemetry_delay_min(&mut self, millis: u32) {
        write_le(&mut self.bytes, config::TELEMETRY_DELAY_MIN, 4, millis);
    }

    /// Upper bound (exclusive) of the broadcast response delay,
    /// milliseconds.
    pub fn telemetry_delay_max(&self) -> u32 {
        read_le(&self.bytes, config::TELEMETRY_DELAY_MAX, 4)
    }

    pub fn set_telemetry_delay_max(&mut self, millis: u32) {
        write_le(&mut self.bytes, config::TELEMETRY_DELAY_MAX, 4, millis);
    }

    pub fn flags(&self) -> ConfigFlags {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[config::FLAGS..config::FLAGS + 4]);
        ConfigFlags::from_bytes(word)
    }

    pub fn set_flags(&mut self, flags: ConfigFlags) {
        self.bytes[config::FLAGS..config::FLAGS + 4].copy_from_slice(&flags.into_bytes());
    }

    /// Offset from UTC in seconds.
    pub fn timezone(&self) -> i32 {
        read_le(&self.bytes, config::TIMEZONE, 4) as i32
    }

    pub fn set_timezone(&mut self, offset: i32) {
        write_le(&mut self.bytes, config::TIMEZONE, 4, offset as u32);
    }

    /// Two-letter region and country codes.
    pub fn location(&self) -> [u8; config::LOCATION_LEN] {
        let mut loc = [0u8; config::LOCATION_LEN];
        loc.copy_from_slice(&self.bytes[config::LOCATION..config::LOCATION + config::LOCATION_LEN]);
        loc
    }

    pub fn set_location(&mut self, location: [u8; config::LOCATION_LEN]) {
        self.bytes[config::LOCATION..config::LOCATION + config::LOCATION_LEN]
            .copy_from_slice(&location);
    }

    /// GPIO block for devices of `class`, if the class carries one.
    pub fn gpio(&self, class: u8) -> Option<GpioConfig<'_>> {
        let base = gpio_block_offset(class)?;
        Some(GpioConfig {
            bytes: &self.bytes[base..base + config::GPIO_BLOCK_LEN],
        })
    }

    pub fn gpio_mut(&mut self, class: u8) -> Option<GpioConfigMut<'_>> {
        let base = gpio_block_offset(class)?;
        Some(GpioConfigMut {
            bytes: &mut self.bytes[base..base + config::GPIO_BLOCK_LEN],
        })
    }

    pub(crate) fn read(&self, offset: usize, size: usize) -> u32 {
        read_le(&self.bytes, offset, size)
    }

    pub(crate) fn write(&mut self, offset: usize, size: usize, value: u32) {
        write_le(&mut self.bytes, offset, size, value);
    }
}

fn gpio_block_offset(class: u8) -> Option<usize> {
    match class {
        0 => Some(config::C0_PULSE_DURATIONS),
        1 => Some(config::C1_PULSE_DURATIONS),
        _ => None,
    }
}

/// Read view of one per-class GPIO configuration block.
#[derive(Debug, Clone, Copy)]
pub struct GpioConfig<'a> {
    bytes: &'a [u8],
}

impl GpioConfig<'_> {
    /// Pulse duration of output `index` (0..8), milliseconds.
    pub fn pulse_duration(&self, index: usize) -> Option<u32> {
        if index < 8 {
            Some(read_le(self.bytes, index * 4, 4))
        } else {
            None
        }
    }

    /// Per-pin direction bitmap.
    pub fn directions(&self) -> u32 {
        read_le(self.bytes, config::PULSE_DURATIONS_LEN, 4)
    }

    /// Output levels applied at startup.
    pub fn outputs_default(&self) -> u32 {
        read_le(self.bytes, config::PULSE_DURATIONS_LEN + 4, 4)
    }

    /// Pins whose edges trigger an unsolicited telemetry.
    pub fn telemetry_on_change(&self) -> u32 {
        read_le(self.bytes, config::PULSE_DURATIONS_LEN + 8, 4)
    }
}

/// Write view of one per-class GPIO configuration block.
#[derive(Debug)]
pub struct GpioConfigMut<'a> {
    bytes: &'a mut [u8],
}

impl GpioConfigMut<'_> {
    pub fn set_pulse_duration(&mut self, index: usize, millis: u32) {
        if index < 8 {
            write_le(self.bytes, index * 4, 4, millis);
        }
    }

    pub fn set_directions(&mut self, bitmap: u32) {
        write_le(self.bytes, config::PULSE_DURATIONS_LEN, 4, bitmap);
    }

    pub fn set_outputs_default(&mut self, bitmap: u32) {
        write_le(self.bytes, config::PULSE_DURATIONS_LEN + 4, 4, bitmap);
    }

    pub fn set_telemetry_on_change(&mut self, bitmap: u32) {
        write_le(self.bytes, config::PULSE_DURATIONS_LEN + 8, 4, bitmap);
    }
}
