//! The device: attribute engine, request dispatcher and cooperative loop.
//!
//! A [`Device`] owns the only mutable protocol state (system counters,
//! configuration RAM, pending-telemetry bits), a [`Driver`] giving it the
//! bus and the clock, and an [`Application`] supplying command execution
//! and telemetry contents. A process can host several devices side by
//! side; nothing here is global.
//!
//! The core never blocks and never spawns: one call to
//! [`Device::process`] performs one cooperative step (poll the driver,
//! update the timebase, fire periodic telemetry, answer at most one
//! request), and [`Device::time_until_next_process`] tells the caller how
//! long it may sleep before the next one.

use core::time::Duration;

use crate::attr::{self, Access};
use crate::blc;
use crate::filter;
use crate::frame::{self, Direction, Endpoint, Frame, FrameKind, Id};
use crate::schema::{system, ClassRestriction, RoleFlags, SectionId};
use crate::state::{Config, Identification, SystemState};
use crate::{DeviceId, Error};

/// Spread of the randomised broadcast-response delay when the configured
/// window is empty (`delay_max <= delay_min`), in milliseconds.
pub const DELAY_MAX_DEFAULT: u32 = 100;

/// Seconds/milliseconds pair sampled from the driver's clock.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub millis: u16,
}

impl Timestamp {
    pub const fn as_millis(self) -> u64 {
        self.secs as u64 * 1000 + self.millis as u64
    }
}

/// Hardware access consumed by the core.
///
/// Implementations are expected to be non-blocking; the caller of
/// [`Device::process`] decides how receive readiness and send completion
/// are scheduled. Remote and extended-id frames must not be surfaced
/// here; a CANIOT device never matches them (hardware acceptance filters
/// configured from [`crate::filter`] take care of this, software drivers
/// can use [`crate::filter::is_target_can`]).
pub trait Driver {
    /// Transport error type, kept apart from the protocol taxonomy.
    type Error;

    /// Pops the next pending frame. `Err(nb::Error::WouldBlock)` means
    /// the mailbox is empty and is not a failure.
    fn recv(&mut self) -> nb::Result<Frame, Self::Error>;

    /// Queues `frame` for transmission no earlier than `delay` from now.
    fn send(&mut self, frame: &Frame, delay: Duration) -> Result<(), Self::Error>;

    /// Current wall-clock (or monotonic) time.
    fn time(&mut self) -> Timestamp;

    /// Re-bases the wall clock to `secs`.
    fn set_time(&mut self, secs: u32);

    /// Fills `buf` with cryptographically-unimportant randomness.
    fn entropy(&mut self, buf: &mut [u8]);
}

/// Application hooks invoked by the core.
///
/// Every method has a default, so an application only implements the
/// slots it supports:
///
/// * [`command`](Application::command) / [`telemetry`](Application::telemetry)
///   default to [`Error::CommandHandler`] / [`Error::TelemetryHandler`]
///   ("no handler installed").
/// * [`config_read`](Application::config_read) /
///   [`config_write`](Application::config_write) default to doing
///   nothing, which leaves the configuration purely RAM-resident.
/// * [`custom_attribute_read`](Application::custom_attribute_read) /
///   [`custom_attribute_write`](Application::custom_attribute_write) are
///   consulted only when
///   [`has_custom_attributes`](Application::has_custom_attributes)
///   reports that both are implemented; otherwise unresolved keys keep
///   their resolution error.
/// * [`board_command`](Application::board_command) defaults to
///   [`Error::NotSupported`].
pub trait Application {
    /// Executes an application command on `endpoint`.
    fn command(&mut self, _endpoint: Endpoint, _payload: &[u8]) -> Result<(), Error> {
        Err(Error::CommandHandler)
    }

    /// Fills `buf` with the telemetry payload for `endpoint` and returns
    /// its length (at most 8).
    fn telemetry(&mut self, _endpoint: Endpoint, _buf: &mut [u8]) -> Result<usize, Error> {
        Err(Error::TelemetryHandler)
    }

    /// Refreshes `config` from persistent storage. Called before the
    /// configuration section is read while marked dirty.
    fn config_read(&mut self, _config: &mut Config) -> Result<(), Error> {
        Ok(())
    }

    /// Persists `config`. Called after every configuration-section write.
    fn config_write(&mut self, _config: &Config) -> Result<(), Error> {
        Ok(())
    }

    /// Declares that the application implements **both**
    /// [`custom_attribute_read`](Application::custom_attribute_read) and
    /// [`custom_attribute_write`](Application::custom_attribute_write).
    /// Delegation of unresolved keys is all-or-nothing: while this
    /// returns `false`, neither slot is consulted.
    fn has_custom_attributes(&self) -> bool {
        false
    }

    /// Reads an application-defined attribute. Consulted only when `key`
    /// resolves to nothing in the catalogue and
    /// [`has_custom_attributes`](Application::has_custom_attributes) is
    /// true; `None` declines the key.
    fn custom_attribute_read(&mut self, _key: u16) -> Option<Result<u32, Error>> {
        None
    }

    /// Writes an application-defined attribute; see
    /// [`custom_attribute_read`](Application::custom_attribute_read).
    fn custom_attribute_write(&mut self, _key: u16, _value: u32) -> Option<Result<(), Error>> {
        None
    }

    /// Executes a board-level system command (reset, watchdog,
    /// config-reset). Only called for non-empty commands.
    fn board_command(&mut self, _command: blc::SystemCommand) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
}

/// Failure of one [`Device::process`] step.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError<E> {
    /// Protocol-level failure; when permitted by the configuration it has
    /// already been reported on the bus as an error frame.
    Protocol(Error),
    /// The driver failed; nothing was or will be sent this step.
    Transport(E),
}

impl<E> From<Error> for ProcessError<E> {
    fn from(error: Error) -> ProcessError<E> {
        ProcessError::Protocol(error)
    }
}

/// Pending-telemetry endpoint bits, drained highest-priority first.
#[derive(Debug, Clone, Copy, Default)]
struct EndpointSet(u8);

impl EndpointSet {
    const PRIORITY: [Endpoint; 4] = [
        Endpoint::BoardControl,
        Endpoint::Ep2,
        Endpoint::Ep1,
        Endpoint::App,
    ];

    fn insert(&mut self, endpoint: Endpoint) {
        self.0 |= 1 << endpoint as u8;
    }

    fn remove(&mut self, endpoint: Endpoint) {
        self.0 &= !(1 << endpoint as u8);
    }

    fn next_pending(self) -> Option<Endpoint> {
        Self::PRIORITY
            .into_iter()
            .find(|endpoint| self.0 & (1 << *endpoint as u8) != 0)
    }
}

/// What the dispatcher reports back to the loop on failure.
struct Rejection {
    error: Error,
    /// Offending attribute key, when it was decoded.
    key: Option<u16>,
    /// Kind of the error frame to answer with; `None` stays silent.
    respond_as: Option<FrameKind>,
}

impl Rejection {
    fn silent(error: Error) -> Rejection {
        Rejection {
            error,
            key: None,
            respond_as: None,
        }
    }

    fn respond(error: Error, kind: FrameKind) -> Rejection {
        Rejection {
            error,
            key: None,
            respond_as: Some(kind),
        }
    }

    fn attribute(error: Error, key: Option<u16>) -> Rejection {
        Rejection {
            error,
            key,
            respond_as: Some(FrameKind::WriteAttribute),
        }
    }
}

/// A CANIOT device instance.
pub struct Device<'a, D, A> {
    driver: D,
    app: A,
    identification: &'a Identification,
    system: SystemState,
    config: Config,
    config_dirty: bool,
    verify_targeting: bool,
    requested_telemetry: EndpointSet,
    startup_keys: &'a [u16],
    startup_cursor: usize,
    startup_done: bool,
    /// Millisecond timestamp of the last periodic telemetry emission;
    /// kept outside the system store because it is not an attribute.
    last_telemetry_ms: u64,
}

impl<'a, D, A> Device<'a, D, A>
where
    D: Driver,
    A: Application,
{
    /// Builds a device around its identity, configuration, driver and
    /// application. Fails with [`Error::Invalid`] when the identity
    /// carries a class or sub-id of 7 (reserved for broadcast).
    pub fn new(
        identification: &'a Identification,
        config: Config,
        driver: D,
        app: A,
    ) -> Result<Device<'a, D, A>, Error> {
        let did = identification.did();
        if did.class() == 7 || did.sub_id() == 7 {
            return Err(Error::Invalid);
        }
        Ok(Device {
            driver,
            app,
            identification,
            system: SystemState::new(),
            config,
            config_dirty: true,
            verify_targeting: true,
            requested_telemetry: EndpointSet::default(),
            startup_keys: &[],
            startup_cursor: 0,
            startup_done: true,
            last_telemetry_ms: 0,
        })
    }

    /// Installs an ordered list of attribute keys published as
    /// read-attribute responses over the first idle `process()` calls.
    pub fn with_startup_attributes(mut self, keys: &'a [u16]) -> Device<'a, D, A> {
        self.startup_keys = keys;
        self.startup_cursor = 0;
        self.startup_done = keys.is_empty();
        self
    }

    /// Disables the software targeting check, for drivers whose hardware
    /// acceptance filters already guarantee every delivered frame is
    /// addressed to this device.
    pub fn with_targeting_verification(mut self, verify: bool) -> Device<'a, D, A> {
        self.verify_targeting = verify;
        self
    }

    pub fn did(&self) -> DeviceId {
        self.identification.did()
    }

    pub fn identification(&self) -> &Identification {
        self.identification
    }

    pub fn system(&self) -> &SystemState {
        &self.system
    }

    /// Battery level is sampled by the application, not the core.
    pub fn set_battery(&mut self, level: u8) {
        self.system.set_battery(level);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct access to configuration RAM. Changes are not persisted;
    /// use [`Device::invalidate_config`] if persistent storage changed
    /// behind the core's back.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Marks configuration RAM stale; the next access reloads it through
    /// [`Application::config_read`].
    pub fn invalidate_config(&mut self) {
        self.config_dirty = true;
    }

    /// Requests an unsolicited telemetry emission on `endpoint` at the
    /// next idle `process()` call.
    pub fn request_telemetry(&mut self, endpoint: Endpoint) {
        self.requested_telemetry.insert(endpoint);
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn application(&self) -> &A {
        &self.app
    }

    pub fn application_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// One cooperative step: refresh the timebase, trigger periodic
    /// telemetry, answer one inbound frame or publish one pending frame.
    pub fn process(&mut self) -> Result<(), ProcessError<D::Error>> {
        if self.config_dirty && self.app.config_read(&mut self.config).is_ok() {
            self.config_dirty = false;
        }

        let now = self.driver.time();
        let now_ms = now.as_millis();
        self.system.set_time(now.secs);
        self.system
            .set_uptime(now.secs.wrapping_sub(self.system.start_time()));

        let flags = self.config.flags();
        if flags.telemetry_periodic()
            && now_ms.saturating_sub(self.last_telemetry_ms)
                >= u64::from(self.config.telemetry_period())
        {
            self.requested_telemetry.insert(flags.telemetry_endpoint());
        }

        let mut outgoing: Option<Frame> = None;
        let mut broadcast = false;
        let mut result: Result<(), Error> = Ok(());

        match self.driver.recv() {
            Ok(req) => {
                if self.verify_targeting && !filter::is_target(self.did(), u16::from(req.id())) {
                    self.system.bump_rx_ignored();
                    return Err(ProcessError::Protocol(Error::Unexpected));
                }
                broadcast = req.id().is_broadcast();
                match self.dispatch(&req) {
                    Ok(resp) => outgoing = Some(resp),
                    Err(rejection) => {
                        result = Err(rejection.error);
                        if let Some(kind) = rejection.respond_as {
                            if self.config.flags().error_response() {
                                outgoing = Some(self.error_frame(
                                    kind,
                                    req.id().endpoint(),
                                    rejection.error,
                                    rejection.key,
                                ));
                            }
                        }
                    }
                }
            }
            Err(nb::Error::WouldBlock) => {
                if !self.startup_done {
                    let key = self.startup_keys[self.startup_cursor];
                    self.startup_cursor += 1;
                    if self.startup_cursor == self.startup_keys.len() {
                        self.startup_done = true;
                    }
                    // a failing startup attribute is skipped, not fatal
                    if let Ok(value) = self.attribute_read(key) {
                        outgoing = Some(Frame::attribute_response(
                            self.response_id(FrameKind::ReadAttribute, Endpoint::App),
                            key,
                            value,
                        ));
                    }
                } else if let Some(endpoint) = self.requested_telemetry.next_pending() {
                    match self.build_telemetry(endpoint) {
                        Ok(telemetry) => outgoing = Some(telemetry),
                        Err(error) => result = Err(error),
                    }
                }
            }
            Err(nb::Error::Other(error)) => return Err(ProcessError::Transport(error)),
        }

        if let Some(ref out) = outgoing {
            let delay = if broadcast {
                self.broadcast_delay()
            } else {
                Duration::ZERO
            };
            self.driver
                .send(out, delay)
                .map_err(ProcessError::Transport)?;
            self.system.bump_tx_total();

            if out.id().kind() == FrameKind::Telemetry {
                let endpoint = out.id().endpoint();
                self.requested_telemetry.remove(endpoint);
                let flags = self.config.flags();
                if flags.telemetry_periodic() && endpoint == flags.telemetry_endpoint() {
                    self.last_telemetry_ms = now_ms;
                    self.system.set_last_telemetry(self.system.time());
                }
            }
        }

        result.map_err(ProcessError::Protocol)
    }

    /// How long the caller may sleep before the next [`Device::process`]:
    /// zero when startup attributes are pending or the telemetry period
    /// has elapsed, `None` when nothing is scheduled.
    pub fn time_until_next_process(&mut self) -> Option<Duration> {
        if !self.startup_done {
            return Some(Duration::ZERO);
        }
        let flags = self.config.flags();
        if !flags.telemetry_periodic() {
            return None;
        }
        let now_ms = self.driver.time().as_millis();
        let period = u64::from(self.config.telemetry_period());
        let elapsed = now_ms.saturating_sub(self.last_telemetry_ms);
        Some(Duration::from_millis(period.saturating_sub(elapsed)))
    }

    fn dispatch(&mut self, req: &Frame) -> Result<Frame, Rejection> {
        if req.id().direction() != Direction::Query {
            return Err(Rejection::silent(Error::Invalid));
        }
        self.system.bump_rx_total();

        let endpoint = req.id().endpoint();
        match req.id().kind() {
            FrameKind::Command => {
                self.system.bump_rx_command();
                let outcome = self.run_command(endpoint, req.data());
                self.system
                    .set_last_command_error(outcome.err().map_or(0, Error::errno));
                match outcome {
                    Ok(()) => self
                        .build_telemetry(endpoint)
                        .map_err(|e| Rejection::respond(e, FrameKind::Command)),
                    Err(error) => Err(Rejection::respond(error, FrameKind::Command)),
                }
            }
            FrameKind::Telemetry => {
                self.system.bump_rx_request_telemetry();
                self.build_telemetry(endpoint)
                    .map_err(|e| Rejection::respond(e, FrameKind::Command))
            }
            FrameKind::WriteAttribute => {
                self.system.bump_rx_write_attribute();
                let key = frame::read_key(req.data())
                    .map_err(|e| Rejection::attribute(e, None))?;
                let value = frame::read_value(req.data())
                    .map_err(|e| Rejection::attribute(e, None))?;
                self.attribute_write(key, value)
                    .map_err(|e| Rejection::attribute(e, Some(key)))?;
                let value = self
                    .attribute_read(key)
                    .map_err(|e| Rejection::attribute(e, Some(key)))?;
                Ok(Frame::attribute_response(
                    self.response_id(FrameKind::ReadAttribute, endpoint),
                    key,
                    value,
                ))
            }
            FrameKind::ReadAttribute => {
                self.system.bump_rx_read_attribute();
                let key = frame::read_key(req.data())
                    .map_err(|e| Rejection::attribute(e, None))?;
                let value = self
                    .attribute_read(key)
                    .map_err(|e| Rejection::attribute(e, Some(key)))?;
                Ok(Frame::attribute_response(
                    self.response_id(FrameKind::ReadAttribute, endpoint),
                    key,
                    value,
                ))
            }
        }
    }

    fn run_command(&mut self, endpoint: Endpoint, payload: &[u8]) -> Result<(), Error> {
        if endpoint == Endpoint::BoardControl && payload.len() == frame::MAX_LEN {
            let sys = blc::SystemCommand::from_bytes([payload[frame::MAX_LEN - 1]]);
            if !sys.is_noop() {
                self.app.board_command(sys)?;
            }
        }
        self.app.command(endpoint, payload)
    }

    fn build_telemetry(&mut self, endpoint: Endpoint) -> Result<Frame, Error> {
        let mut buf = [0u8; frame::MAX_LEN];
        match self.app.telemetry(endpoint, &mut buf) {
            Ok(len) => {
                self.system.set_last_telemetry_error(0);
                self.system.bump_tx_telemetry();
                let len = len.min(frame::MAX_LEN);
                Ok(Frame::new(
                    self.response_id(FrameKind::Telemetry, endpoint),
                    &buf[..len],
                ))
            }
            Err(error) => {
                self.system.set_last_telemetry_error(error.errno());
                Err(error)
            }
        }
    }

    /// Response identifiers always carry the class/sub-id read back from
    /// identification memory, never a copy cached elsewhere.
    fn response_id(&self, kind: FrameKind, endpoint: Endpoint) -> Id {
        let did = self.identification.did();
        Id::new()
            .with_kind(kind)
            .with_direction(Direction::Response)
            .with_class(did.class())
            .with_sub_id(did.sub_id())
            .with_endpoint(endpoint)
    }

    fn error_frame(
        &self,
        kind: FrameKind,
        endpoint: Endpoint,
        error: Error,
        key: Option<u16>,
    ) -> Frame {
        // the wire word negates the failing component's result: handler
        // results are already negative, attribute-layer results are the
        // positive taxonomy codes
        let code = match kind {
            FrameKind::Command => i32::from(error.code()),
            _ => error.errno(),
        };
        Frame::error_response(self.response_id(kind, endpoint), code, key)
    }

    fn broadcast_delay(&mut self) -> Duration {
        let min = self.config.telemetry_delay_min();
        let max = self.config.telemetry_delay_max();
        let amplitude = if max > min { max - min } else { DELAY_MAX_DEFAULT };
        let mut raw = [0u8; 2];
        self.driver.entropy(&mut raw);
        let sample = u32::from(u16::from_le_bytes(raw));
        Duration::from_millis(u64::from(min) + u64::from(sample % amplitude))
    }

    fn check_class(&self, access: &Access) -> Result<(), Error> {
        match access.class {
            ClassRestriction::Any => Ok(()),
            ClassRestriction::Only(class) if class == self.did().class() => Ok(()),
            ClassRestriction::Only(_) => Err(Error::ClassAttribute),
        }
    }

    /// Reads the 32-bit window named by `key`, honoring role and class
    /// gating. Values narrower than 4 bytes zero-extend.
    pub fn attribute_read(&mut self, key: u16) -> Result<u32, Error> {
        let access = match attr::resolve(key) {
            Ok(access) => access,
            Err(error) => {
                if self.app.has_custom_attributes() {
                    return self.app.custom_attribute_read(key).unwrap_or(Err(error));
                }
                return Err(error);
            }
        };
        self.check_class(&access)?;
        if !access.flags.contains(RoleFlags::READABLE) {
            return Err(Error::AttributeRead);
        }
        match access.section {
            SectionId::Identification => Ok(self.identification.read(access.offset, access.size)),
            SectionId::System => Ok(self.system.read(access.offset, access.size)),
            SectionId::Configuration => {
                if self.config_dirty {
                    self.app.config_read(&mut self.config)?;
                    self.config_dirty = false;
                }
                Ok(self.config.read(access.offset, access.size))
            }
        }
    }

    /// Writes the 32-bit window named by `key`, honoring role and class
    /// gating, the persistence protocol and the time re-basing special
    /// case.
    pub fn attribute_write(&mut self, key: u16, value: u32) -> Result<(), Error> {
        let access = match attr::resolve(key) {
            Ok(access) => access,
            Err(error) => {
                if self.app.has_custom_attributes() {
                    return self
                        .app
                        .custom_attribute_write(key, value)
                        .unwrap_or(Err(error));
                }
                return Err(error);
            }
        };
        self.check_class(&access)?;
        if !access.flags.contains(RoleFlags::WRITABLE) {
            return Err(Error::ReadOnlyAttribute);
        }
        match access.section {
            SectionId::Identification => Err(Error::ReadOnlyAttribute),
            SectionId::System => {
                if key == system::TIME_KEY {
                    self.write_system_time(value);
                } else {
                    self.system.write(access.offset, access.size, value);
                }
                Ok(())
            }
            SectionId::Configuration => {
                self.config.write(access.offset, access.size, value);
                if !access.persistent {
                    return Ok(());
                }
                // the persistence callback may consult the clock and
                // legitimately re-base it; preserve deadlines across it
                let before = self.driver.time();
                let outcome = self.app.config_write(&self.config);
                let after = self.driver.time();
                self.shift_clock(i64::from(after.secs) - i64::from(before.secs));
                outcome
            }
        }
    }

    /// Re-bases the wall clock while keeping every relative deadline
    /// (telemetry period, uptime) where it was.
    fn write_system_time(&mut self, secs: u32) {
        let current = self.driver.time();
        self.driver.set_time(secs);
        self.shift_clock(i64::from(secs) - i64::from(current.secs));
        self.system.set_time(secs);
        self.system
            .set_uptime_synced(secs.wrapping_sub(self.system.start_time()));
    }

    fn shift_clock(&mut self, delta_secs: i64) {
        if delta_secs == 0 {
            return;
        }
        self.system
            .set_start_time(shift_u32(self.system.start_time(), delta_secs));
        self.system
            .set_last_telemetry(shift_u32(self.system.last_telemetry(), delta_secs));
        self.last_telemetry_ms = shift_ms(self.last_telemetry_ms, delta_secs);
    }
}

fn shift_u32(value: u32, delta_secs: i64) -> u32 {
    (i64::from(value) + delta_secs).clamp(0, i64::from(u32::MAX)) as u32
}

fn shift_ms(value_ms: u64, delta_secs: i64) -> u64 {
    let shifted = value_ms as i64 + delta_secs.saturating_mul(1000);
    shifted.max(0) as u64
}
