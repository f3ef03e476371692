use core::time::Duration;
use std::collections::VecDeque;

use caniot::blc::SystemCommand;
use caniot::frame::{Direction, Endpoint, Frame, FrameKind, Id};
use caniot::{
    Application, Config, Device, DeviceId, Driver, Error, Identification, ProcessError, Timestamp,
};

// class 1, sub-id 2
static IDENT: Identification =
    Identification::new(DeviceId::from_raw(0b001_010), 0x0304, "testdev", 0x1234_5678);

#[derive(Default)]
struct MockDriver {
    rx: VecDeque<Frame>,
    sent: Vec<(Frame, Duration)>,
    now: Timestamp,
    entropy: VecDeque<u8>,
    /// Seconds added to the clock every time it is sampled.
    advance_per_query: u32,
}

impl Driver for MockDriver {
    type Error = ();

    fn recv(&mut self) -> nb::Result<Frame, ()> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn send(&mut self, frame: &Frame, delay: Duration) -> Result<(), ()> {
        self.sent.push((*frame, delay));
        Ok(())
    }

    fn time(&mut self) -> Timestamp {
        self.now.secs += self.advance_per_query;
        self.now
    }

    fn set_time(&mut self, secs: u32) {
        self.now.secs = secs;
    }

    fn entropy(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.entropy.pop_front().unwrap_or(0);
        }
    }
}

#[derive(Default)]
struct TestApp {
    command_error: Option<Error>,
    commands: Vec<(Endpoint, Vec<u8>)>,
    board_commands: Vec<u8>,
    telemetry_payload: Vec<u8>,
    config_reads: usize,
    config_writes: usize,
    custom: Option<u32>,
}

impl Application for TestApp {
    fn command(&mut self, endpoint: Endpoint, payload: &[u8]) -> Result<(), Error> {
        self.commands.push((endpoint, payload.to_vec()));
        match self.command_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn telemetry(&mut self, _endpoint: Endpoint, buf: &mut [u8]) -> Result<usize, Error> {
        let len = self.telemetry_payload.len().min(buf.len());
        buf[..len].copy_from_slice(&self.telemetry_payload[..len]);
        Ok(len)
    }

    fn config_read(&mut self, _config: &mut Config) -> Result<(), Error> {
        self.config_reads += 1;
        Ok(())
    }

    fn config_write(&mut self, _config: &Config) -> Result<(), Error> {
        self.config_writes += 1;
        Ok(())
    }

    fn has_custom_attributes(&self) -> bool {
        true
    }

    fn custom_attribute_read(&mut self, key: u16) -> Option<Result<u32, Error>> {
        (key == 0xF000).then(|| Ok(self.custom.unwrap_or(0)))
    }

    fn custom_attribute_write(&mut self, key: u16, value: u32) -> Option<Result<(), Error>> {
        (key == 0xF000).then(|| {
            self.custom = Some(value);
            Ok(())
        })
    }

    fn board_command(&mut self, command: SystemCommand) -> Result<(), Error> {
        self.board_commands.push(command.into_bytes()[0]);
        Ok(())
    }
}

/// Configuration with the periodic trigger disabled so idle `process()`
/// calls stay idle.
fn quiet_config() -> Config {
    let mut config = Config::new();
    let flags = config.flags().with_telemetry_periodic(false);
    config.set_flags(flags);
    config
}

fn device(config: Config) -> Device<'static, MockDriver, TestApp> {
    Device::new(&IDENT, config, MockDriver::default(), TestApp::default()).unwrap()
}

fn query_id(kind: FrameKind, endpoint: Endpoint) -> Id {
    Id::new()
        .with_kind(kind)
        .with_direction(Direction::Query)
        .with_class(1)
        .with_sub_id(2)
        .with_endpoint(endpoint)
}

fn broadcast_id(kind: FrameKind, endpoint: Endpoint) -> Id {
    Id::new()
        .with_kind(kind)
        .with_direction(Direction::Query)
        .with_class(7)
        .with_sub_id(7)
        .with_endpoint(endpoint)
}

#[test]
fn rejects_broadcast_identity() {
    static BAD: Identification =
        Identification::new(DeviceId::from_raw(0b111_111), 1, "bad", 0);
    let result = Device::new(&BAD, quiet_config(), MockDriver::default(), TestApp::default());
    assert!(matches!(result, Err(Error::Invalid)));
}

/// Reading identification.version echoes the key with the value
/// zero-extended to 32 bits.
#[test]
fn read_version() {
    let mut dev = device(quiet_config());
    dev.driver_mut()
        .rx
        .push_back(Frame::attribute_query(
            query_id(FrameKind::ReadAttribute, Endpoint::App),
            0x0010,
        ));
    dev.process().unwrap();

    let (resp, delay) = dev.driver().sent[0];
    assert_eq!(delay, Duration::ZERO);
    assert_eq!(resp.id().kind(), FrameKind::ReadAttribute);
    assert_eq!(resp.id().direction(), Direction::Response);
    assert_eq!(resp.id().class(), 1);
    assert_eq!(resp.id().sub_id(), 2);
    assert_eq!(resp.id().endpoint(), Endpoint::App);
    assert_eq!(resp.data(), &[0x10, 0x00, 0x04, 0x03, 0x00, 0x00]);

    assert_eq!(dev.system().rx_total(), 1);
    assert_eq!(dev.system().rx_read_attribute(), 1);
    assert_eq!(dev.system().tx_total(), 1);
}

/// Writing configuration.telemetry_period is answered as a read response
/// after the persistence callback ran.
#[test]
fn write_telemetry_period() {
    let mut dev = device(quiet_config());
    dev.driver_mut().rx.push_back(Frame::new(
        query_id(FrameKind::WriteAttribute, Endpoint::App),
        &[0x00, 0x20, 0x60, 0xEA, 0x00, 0x00],
    ));
    dev.process().unwrap();

    assert_eq!(dev.application().config_writes, 1);
    assert_eq!(dev.config().telemetry_period(), 60_000);

    let (resp, _) = dev.driver().sent[0];
    assert_eq!(resp.id().kind(), FrameKind::ReadAttribute);
    assert_eq!(resp.data(), &[0x00, 0x20, 0x60, 0xEA, 0x00, 0x00]);
    assert_eq!(dev.system().rx_write_attribute(), 1);
}

/// A failing command handler produces a command error frame.
#[test]
fn command_error_frame() {
    let mut dev = device(quiet_config());
    dev.application_mut().command_error = Some(Error::CommandHandler);
    dev.driver_mut().rx.push_back(Frame::new(
        query_id(FrameKind::Command, Endpoint::Ep1),
        &[0xAA],
    ));

    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::CommandHandler)));

    let (resp, _) = dev.driver().sent[0];
    assert_eq!(resp.id().kind(), FrameKind::Command);
    assert_eq!(resp.id().direction(), Direction::Response);
    assert_eq!(resp.id().endpoint(), Endpoint::Ep1);
    assert_eq!(resp.data(), &[0x0B, 0x3A, 0x00, 0x00]);

    assert_eq!(dev.system().last_command_error(), Error::CommandHandler.errno());
    assert_eq!(dev.system().rx_command(), 1);
}

/// A broadcast telemetry request is answered from the device's own
/// address with a randomised delay inside the configured window.
#[test]
fn broadcast_telemetry_delayed() {
    let mut config = quiet_config();
    config.set_telemetry_delay_min(10);
    config.set_telemetry_delay_max(50);
    let mut dev = device(config);
    dev.application_mut().telemetry_payload = vec![1, 2, 3];
    dev.driver_mut().entropy.extend([0x07, 0x00]);
    dev.driver_mut().rx.push_back(Frame::new(
        broadcast_id(FrameKind::Telemetry, Endpoint::Ep1),
        &[],
    ));
    dev.process().unwrap();

    let (resp, delay) = dev.driver().sent[0];
    assert_eq!(resp.id().kind(), FrameKind::Telemetry);
    assert_eq!(resp.id().direction(), Direction::Response);
    assert_eq!(resp.id().class(), 1);
    assert_eq!(resp.id().sub_id(), 2);
    assert_eq!(resp.data(), &[1, 2, 3]);
    // 10 + (7 % 40)
    assert_eq!(delay, Duration::from_millis(17));
    assert!(delay >= Duration::from_millis(10) && delay < Duration::from_millis(50));
}

/// The delay window collapses to the default spread when
/// delay_max <= delay_min.
#[test]
fn broadcast_delay_default_window() {
    let mut config = quiet_config();
    config.set_telemetry_delay_min(200);
    config.set_telemetry_delay_max(100);
    let mut dev = device(config);
    dev.application_mut().telemetry_payload = vec![0xEE];
    dev.driver_mut().entropy.extend([0xFF, 0x00]);
    dev.driver_mut().rx.push_back(Frame::new(
        broadcast_id(FrameKind::Telemetry, Endpoint::App),
        &[],
    ));
    dev.process().unwrap();

    let (_, delay) = dev.driver().sent[0];
    // 200 + (255 % 100)
    assert_eq!(delay, Duration::from_millis(255));
    assert!(delay >= Duration::from_millis(200) && delay < Duration::from_millis(300));
}

/// Startup attributes are published in order over idle steps.
#[test]
fn startup_attribute_publication() {
    static KEYS: [u16; 2] = [0x0000, 0x0030];
    let mut dev = device(quiet_config()).with_startup_attributes(&KEYS);

    dev.process().unwrap();
    dev.process().unwrap();
    dev.process().unwrap();

    let sent = &dev.driver().sent;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0.id().kind(), FrameKind::ReadAttribute);
    assert_eq!(sent[0].0.data(), &[0x00, 0x00, 0b001_010, 0x00, 0x00, 0x00]);
    assert_eq!(sent[1].0.data(), &[0x30, 0x00, 0x78, 0x56, 0x34, 0x12]);
    // publication does not count as received traffic
    assert_eq!(dev.system().rx_total(), 0);
    assert_eq!(dev.system().tx_total(), 2);
}

#[test]
fn startup_pending_means_no_sleep() {
    static KEYS: [u16; 1] = [0x0000];
    let mut dev = device(quiet_config()).with_startup_attributes(&KEYS);
    assert_eq!(dev.time_until_next_process(), Some(Duration::ZERO));
    dev.process().unwrap();
    // periodic disabled: nothing scheduled anymore
    assert_eq!(dev.time_until_next_process(), None);
}

/// Reading an out-of-range part yields an attribute error frame
/// carrying both the code and the offending key.
#[test]
fn invalid_part_error_frame() {
    let mut dev = device(quiet_config());
    dev.driver_mut()
        .rx
        .push_back(Frame::attribute_query(
            query_id(FrameKind::ReadAttribute, Endpoint::App),
            0x0011,
        ));
    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::KeyPart)));

    // -0x3A05 followed by the key
    let (resp, _) = dev.driver().sent[0];
    assert_eq!(resp.id().kind(), FrameKind::WriteAttribute);
    assert_eq!(resp.data(), &[0xFB, 0xC5, 0xFF, 0xFF, 0x11, 0x00, 0x00, 0x00]);
}

#[test]
fn identification_is_not_writable() {
    let mut dev = device(quiet_config());
    assert_eq!(dev.attribute_write(0x0000, 1), Err(Error::ReadOnlyAttribute));
    assert_eq!(dev.attribute_write(0x0030, 1), Err(Error::ReadOnlyAttribute));
}

#[test]
fn hidden_attribute_unreadable() {
    let mut dev = device(quiet_config());
    assert_eq!(dev.attribute_read(0x0050), Err(Error::AttributeRead));
    assert_eq!(dev.attribute_write(0x0050, 0), Err(Error::ReadOnlyAttribute));
}

/// Class-restricted attributes answer only to their class; this device
/// is class 1.
#[test]
fn class_gating() {
    let mut dev = device(quiet_config());
    // class-0 GPIO directions
    assert_eq!(dev.attribute_read(0x2070), Err(Error::ClassAttribute));
    assert_eq!(dev.attribute_write(0x2070, 1), Err(Error::ClassAttribute));
    // class-1 GPIO directions
    assert_eq!(dev.attribute_read(0x20B0), Ok(0));
    assert_eq!(dev.attribute_write(0x20B0, 0xF0), Ok(()));
    assert_eq!(dev.config().gpio(1).unwrap().directions(), 0xF0);
}

#[test]
fn custom_attributes_fill_resolution_gaps() {
    let mut dev = device(quiet_config());
    assert_eq!(dev.attribute_write(0xF000, 0xCAFE), Ok(()));
    assert_eq!(dev.attribute_read(0xF000), Ok(0xCAFE));
    // undeclared keys still fail resolution
    assert_eq!(dev.attribute_read(0xF010), Err(Error::KeySection));
}

/// Delegation is all-or-nothing: an application implementing only the
/// read slot (and not declaring both) is never consulted.
#[test]
fn half_registered_custom_attributes_are_not_consulted() {
    struct ReadOnlyCustomApp;

    impl Application for ReadOnlyCustomApp {
        fn custom_attribute_read(&mut self, key: u16) -> Option<Result<u32, Error>> {
            (key == 0xF000).then(|| Ok(0x1234))
        }
    }

    let mut dev =
        Device::new(&IDENT, quiet_config(), MockDriver::default(), ReadOnlyCustomApp).unwrap();
    assert_eq!(dev.attribute_read(0xF000), Err(Error::KeySection));
    assert_eq!(dev.attribute_write(0xF000, 1), Err(Error::KeySection));
}

/// The periodic trigger fires once the period elapses and is
/// re-armed by the successful send.
#[test]
fn periodic_telemetry() {
    let mut dev = device(Config::new());
    dev.application_mut().telemetry_payload = vec![9];

    dev.process().unwrap();
    assert!(dev.driver().sent.is_empty());

    dev.driver_mut().now.secs = 61;
    dev.process().unwrap();
    let sent = &dev.driver().sent;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.id().kind(), FrameKind::Telemetry);
    assert_eq!(sent[0].0.id().endpoint(), Endpoint::BoardControl);
    assert_eq!(dev.system().last_telemetry(), 61);
    assert_eq!(dev.system().tx_telemetry(), 1);

    // deadline re-armed: nothing more until another period passes
    dev.process().unwrap();
    assert_eq!(dev.driver().sent.len(), 1);
    assert_eq!(dev.time_until_next_process(), Some(Duration::from_millis(60_000)));

    dev.driver_mut().now.secs = 122;
    assert_eq!(dev.time_until_next_process(), Some(Duration::ZERO));
    dev.process().unwrap();
    assert_eq!(dev.driver().sent.len(), 2);
}

#[test]
fn frames_for_other_devices_are_ignored() {
    let mut dev = device(quiet_config());
    let foreign = Id::new()
        .with_kind(FrameKind::Command)
        .with_direction(Direction::Query)
        .with_class(3)
        .with_sub_id(4)
        .with_endpoint(Endpoint::App);
    dev.driver_mut().rx.push_back(Frame::new(foreign, &[]));

    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::Unexpected)));
    assert!(dev.driver().sent.is_empty());
    assert_eq!(dev.system().rx_ignored(), 1);
    assert_eq!(dev.system().rx_total(), 0);
}

/// With the targeting check on, a response-direction frame never matches
/// the query filter and is counted as ignored.
#[test]
fn response_direction_fails_targeting() {
    let mut dev = device(quiet_config());
    let id = query_id(FrameKind::Command, Endpoint::App).with_direction(Direction::Response);
    dev.driver_mut().rx.push_back(Frame::new(id, &[]));

    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::Unexpected)));
    assert!(dev.driver().sent.is_empty());
    assert_eq!(dev.system().rx_ignored(), 1);
}

/// Without it, the dispatcher still rejects the wrong direction, silently.
#[test]
fn response_direction_rejected_by_dispatcher() {
    let mut dev = device(quiet_config()).with_targeting_verification(false);
    let id = query_id(FrameKind::Command, Endpoint::App).with_direction(Direction::Response);
    dev.driver_mut().rx.push_back(Frame::new(id, &[]));

    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::Invalid)));
    assert!(dev.driver().sent.is_empty());
    assert_eq!(dev.system().rx_total(), 0);
    assert_eq!(dev.system().rx_ignored(), 0);
}

#[test]
fn error_frames_can_be_suppressed() {
    let mut config = quiet_config();
    let flags = config.flags().with_error_response(false);
    config.set_flags(flags);
    let mut dev = device(config);
    dev.application_mut().command_error = Some(Error::CommandHandler);
    dev.driver_mut()
        .rx
        .push_back(Frame::new(query_id(FrameKind::Command, Endpoint::App), &[]));

    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::CommandHandler)));
    assert!(dev.driver().sent.is_empty());
}

/// A full-length board-control command carries a system command in its
/// last byte; both it and the application command handler run.
#[test]
fn board_control_system_command() {
    let mut dev = device(quiet_config());
    dev.application_mut().telemetry_payload = vec![0x55];
    let payload = [0, 0, 0, 0, 0, 0, 0, 0b0000_0001]; // hardware reset
    dev.driver_mut().rx.push_back(Frame::new(
        query_id(FrameKind::Command, Endpoint::BoardControl),
        &payload,
    ));
    dev.process().unwrap();

    assert_eq!(dev.application().board_commands, vec![0x01]);
    assert_eq!(dev.application().commands.len(), 1);
    assert_eq!(dev.application().commands[0].1, payload.to_vec());

    // success is answered with telemetry on the same endpoint
    let (resp, _) = dev.driver().sent[0];
    assert_eq!(resp.id().kind(), FrameKind::Telemetry);
    assert_eq!(resp.id().endpoint(), Endpoint::BoardControl);
}

#[test]
fn zero_or_short_board_commands_skip_the_handler() {
    let mut dev = device(quiet_config());
    dev.application_mut().telemetry_payload = vec![0x55];
    dev.driver_mut().rx.push_back(Frame::new(
        query_id(FrameKind::Command, Endpoint::BoardControl),
        &[0; 8],
    ));
    dev.driver_mut().rx.push_back(Frame::new(
        query_id(FrameKind::Command, Endpoint::BoardControl),
        &[0x01, 0x02],
    ));
    dev.process().unwrap();
    dev.process().unwrap();

    assert!(dev.application().board_commands.is_empty());
    assert_eq!(dev.application().commands.len(), 2);
}

/// Writing the wall-clock attribute re-bases the clock while keeping the
/// telemetry deadline and uptime where they were.
#[test]
fn system_time_write_shifts_deadlines() {
    let mut dev = device(quiet_config());
    dev.driver_mut().now.secs = 1000;
    dev.process().unwrap();
    assert_eq!(dev.system().time(), 1000);

    assert_eq!(dev.attribute_write(0x1010, 5000), Ok(()));
    assert_eq!(dev.driver().now.secs, 5000);
    assert_eq!(dev.system().time(), 5000);
    assert_eq!(dev.system().start_time(), 4000);
    assert_eq!(dev.system().uptime_synced(), 1000);
    assert_eq!(dev.system().last_telemetry(), 4000);

    // readable through the attribute path too
    assert_eq!(dev.attribute_read(0x1010), Ok(5000));
}

/// The persistence callback may consume time (e.g. a flash write); the
/// observed clock delta shifts relative deadlines.
#[test]
fn config_write_clock_drift_preserves_deadlines() {
    let mut dev = device(quiet_config());
    dev.driver_mut().advance_per_query = 3;
    assert_eq!(dev.attribute_write(0x2040, 7200), Ok(()));
    // one sample before the callback, one after: +3 s observed drift
    assert_eq!(dev.system().start_time(), 3);
    assert_eq!(dev.config().timezone(), 7200);
    assert_eq!(dev.application().config_writes, 1);
}

#[test]
fn config_reload_after_invalidate() {
    let mut dev = device(quiet_config());
    dev.process().unwrap();
    assert_eq!(dev.application().config_reads, 1);
    dev.process().unwrap();
    assert_eq!(dev.application().config_reads, 1);

    dev.invalidate_config();
    assert_eq!(dev.attribute_read(0x2000), Ok(60_000));
    assert_eq!(dev.application().config_reads, 2);
}

#[test]
fn requested_telemetry_served_by_priority() {
    let mut dev = device(quiet_config());
    dev.application_mut().telemetry_payload = vec![7];
    dev.request_telemetry(Endpoint::Ep1);
    dev.request_telemetry(Endpoint::Ep2);

    dev.process().unwrap();
    dev.process().unwrap();
    dev.process().unwrap();

    let sent = &dev.driver().sent;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0.id().endpoint(), Endpoint::Ep2);
    assert_eq!(sent[1].0.id().endpoint(), Endpoint::Ep1);
}

#[test]
fn frame_error_reported_without_key() {
    let mut dev = device(quiet_config());
    // write-attribute payload too short to carry a value
    dev.driver_mut().rx.push_back(Frame::new(
        query_id(FrameKind::WriteAttribute, Endpoint::App),
        &[0x00, 0x20, 0x3C],
    ));
    let outcome = dev.process();
    assert_eq!(outcome, Err(ProcessError::Protocol(Error::Frame)));

    // -0x3A02, no key
    let (resp, _) = dev.driver().sent[0];
    assert_eq!(resp.id().kind(), FrameKind::WriteAttribute);
    assert_eq!(resp.len(), 4);
    assert_eq!(resp.data(), &[0xFE, 0xC5, 0xFF, 0xFF]);
}
