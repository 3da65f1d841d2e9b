use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use periph_kernel::display::DisplayOpcode;
use periph_kernel::i2c::{I2cBus, I2cConfig, I2cOpcode};
use periph_kernel::lifecycle::{Capabilities, TaskProfile};
use periph_kernel::protocol::{Request, ResponseChannel, ResultCode};
use periph_kernel::settings::{MemoryStore, SharedStore};
use periph_kernel::sim::{CaptureSink, SimI2cBus, SimPanel, SimPlatform, SimRadio, SimSpiBus};
use periph_kernel::spi::{SpiBus, SpiConfig, SpiOpcode};
use periph_kernel::state_machine::Mode;
use periph_kernel::system::{
    Firmware, ResetReason, SysOpcode, System, SystemConfig, SystemParts,
};
use periph_kernel::wifi::{
    store_credentials, WifiConfig, WifiConnState, WifiCredentials, WifiNotify, WifiOpcode,
    WifiRadio,
};

const SSID: &str = "bench";
const PASSWORD: &str = "bench-password";

struct Rig {
    mem: MemoryStore,
    platform: SimPlatform,
    radio: SimRadio,
    panel: SimPanel,
    sink: CaptureSink,
}

impl Rig {
    fn new() -> Self {
        Self {
            mem: MemoryStore::new(),
            platform: SimPlatform::default(),
            radio: SimRadio::with_network(SSID, PASSWORD),
            panel: SimPanel::default(),
            sink: CaptureSink::default(),
        }
    }

    fn with_credentials(self) -> Self {
        store_credentials(
            &SharedStore::new(self.mem.clone()),
            &WifiCredentials {
                ssid: SSID.into(),
                password: PASSWORD.into(),
            },
        )
        .unwrap();
        self
    }

    fn caps(&self) -> Capabilities {
        Capabilities::default()
            .with_profile(TaskProfile::fast())
            .with_sink(Arc::new(self.sink.clone()))
    }

    fn full_parts(&self) -> SystemParts {
        let radio = self.radio.clone();
        SystemParts::new(
            SharedStore::new(self.mem.clone()),
            Box::new(self.platform.clone()),
        )
        .with_i2c(
            I2cConfig::default(),
            Box::new(|_: &I2cConfig| {
                Ok(Box::new(SimI2cBus::with_devices(&[0x48])) as Box<dyn I2cBus>)
            }),
        )
        .with_spi(
            SpiConfig::default(),
            Box::new(|_: &SpiConfig| Ok(Box::new(SimSpiBus::new()) as Box<dyn SpiBus>)),
        )
        .with_panel(Box::new(self.panel.clone()))
        .with_wifi(
            WifiConfig::default(),
            Box::new(move || Ok(Box::new(radio) as Box<dyn WifiRadio>)),
        )
    }

    fn boot(&self, reason: ResetReason, parts: SystemParts) -> System {
        let system = System::start(reason, parts, SystemConfig::fast(), &self.caps()).unwrap();
        system.wait_ready(Duration::from_secs(5)).unwrap();
        system
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn boots_platform_then_children_in_order() {
    let rig = Rig::new().with_credentials();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());

    assert_eq!(
        rig.platform.calls(),
        vec![
            "power_down_unused",
            "power_up_required",
            "start_network_interface",
            "create_default_event_loop",
            "start_gpio",
        ]
    );
    assert!(system.i2c().is_some());
    assert!(system.spi().is_some());
    assert!(system.display().is_some());
    assert!(system.wifi().is_some());
    assert!(rig.panel.state().initialized);

    // Children become ready in dependency order
    let order: Vec<String> = rig
        .sink
        .lines()
        .into_iter()
        .filter(|l| l.tag == "system" && l.message.ends_with(" ready"))
        .map(|l| l.message)
        .collect();
    let position = |name: &str| order.iter().position(|m| m.contains(name)).unwrap();
    assert!(position("i2c_run") < position("spi_run"));
    assert!(position("spi_run") < position("disp_run"));
    assert!(position("disp_run") < position("wifi_run"));

    wait_for("wifi connection", || {
        system.wifi_state() == WifiConnState::ConnectedSta
    });
    assert_eq!(rig.radio.connects(), 1);
    system.destroy();
}

#[test]
fn missing_collaborators_skip_their_child() {
    let rig = Rig::new();
    let parts = SystemParts::new(
        SharedStore::new(rig.mem.clone()),
        Box::new(rig.platform.clone()),
    )
    .with_panel(Box::new(rig.panel.clone()));
    let system = rig.boot(ResetReason::PowerOn, parts);

    assert!(system.i2c().is_none());
    assert!(system.i2c_scanner().is_none());
    assert!(system.spi().is_none());
    assert!(system.wifi().is_none());
    let display = system.display().unwrap();
    let reply = ResponseChannel::new();
    let dim = Request::new(DisplayOpcode::SetBrightness)
        .payload(&[10])
        .unwrap();
    let ack = display.transact(dim, &reply, Duration::from_secs(1)).unwrap();
    assert_eq!(ack.result, ResultCode::Ack);
    assert_eq!(rig.panel.state().brightness, 10);
    system.destroy();
}

#[test]
fn boot_count_is_saved_after_the_delay() {
    let rig = Rig::new();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    wait_for("boot count save", || rig.mem.get_u32("system", "bootCount") == Some(1));

    let handle = system.wait_ready(Duration::from_secs(1)).unwrap();
    let reply = ResponseChannel::new();
    let response = handle
        .transact(Request::new(SysOpcode::GetBootCount), &reply, Duration::from_secs(1))
        .unwrap();
    assert_eq!(response.result, ResultCode::Data);
    assert_eq!(response.payload.as_slice(), &1u32.to_le_bytes());
    system.destroy();

    // Second boot continues from the stored count
    let again = rig.boot(ResetReason::Software, rig.full_parts());
    again.destroy();
    assert_eq!(rig.mem.get_u32("system", "bootCount"), Some(2));
    assert_eq!(rig.mem.get_u32("system", "recoveryCount"), Some(0));
}

#[test]
fn abnormal_reset_bumps_recovery_counter() {
    let rig = Rig::new();
    let system = rig.boot(ResetReason::Watchdog, rig.full_parts());
    assert_eq!(rig.mem.get_u32("system", "recoveryCount"), Some(1));
    system.destroy();
}

#[test]
fn destroy_wifi_tears_down_only_wifi() {
    let rig = Rig::new().with_credentials();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    wait_for("wifi connection", || {
        system.wifi_state() == WifiConnState::ConnectedSta
    });
    let wifi = system.wifi().unwrap();

    assert!(system.destroy_wifi());
    wait_for("wifi teardown", || system.wifi().is_none());
    wait_for("disconnected state", || {
        system.wifi_state() == WifiConnState::Disconnected
    });
    assert!(wifi.get_mailbox_handle().is_closed());
    assert!(!wifi.entry_guard().try_take());
    assert!(!rig.radio.is_started());
    assert!(rig.sink.contains("wifi", "wifi_run destroyed"));

    // The rest keeps serving
    let i2c = system.i2c().unwrap();
    let reply = ResponseChannel::new();
    let write = Request::new(I2cOpcode::WriteImmediate)
        .device(0x48)
        .payload(&[0x00, 0x7F])
        .unwrap();
    let ack = i2c.transact(write, &reply, Duration::from_secs(1)).unwrap();
    assert_eq!(ack.result, ResultCode::Ack);
    assert_eq!(system.mode(), Mode::Run);
    system.destroy();
}

#[test]
fn teardown_closes_every_child_mailbox() {
    let rig = Rig::new();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    let i2c = system.i2c().unwrap();
    let spi = system.spi().unwrap();
    let display = system.display().unwrap();
    let wifi = system.wifi().unwrap();
    let monitor = system.monitor();
    system.destroy();

    assert!(i2c.get_mailbox_handle().is_closed());
    assert!(spi.get_mailbox_handle().is_closed());
    assert!(display.get_mailbox_handle().is_closed());
    assert!(wifi.get_mailbox_handle().is_closed());
    assert!(!i2c.entry_guard().is_available());
    assert!(!spi.entry_guard().is_available());
    assert!(!display.entry_guard().is_available());
    assert!(!wifi.entry_guard().is_available());
    assert_eq!(monitor.get(), WifiConnState::Disconnected);
    assert!(!rig.panel.state().powered);

    // Children go first, newest to oldest
    let destroyed: Vec<String> = rig
        .sink
        .lines()
        .into_iter()
        .filter(|l| l.message.contains("destroyed"))
        .map(|l| l.tag)
        .collect();
    assert_eq!(destroyed, vec!["wifi", "display", "spi", "i2c", "system"]);
}

#[test]
fn platform_failure_parks_the_system() {
    let rig = Rig::new();
    let platform = SimPlatform::failing_on("create_default_event_loop");
    let parts = SystemParts::new(SharedStore::new(rig.mem.clone()), Box::new(platform.clone()));
    let system = System::start(ResetReason::PowerOn, parts, SystemConfig::fast(), &rig.caps()).unwrap();

    assert!(system.wait_ready(Duration::from_millis(200)).is_none());
    wait_for("idle", || system.mode() == Mode::Idle);
    assert!(!platform.calls().contains(&"start_gpio"));
    system.destroy();
}

#[test]
fn first_boot_wins() {
    let rig = Rig::new();
    let mut firmware = Firmware::new();
    let caps = rig.caps();
    firmware
        .boot(ResetReason::PowerOn, rig.full_parts(), SystemConfig::fast(), &caps)
        .unwrap();

    let late = SimPlatform::default();
    let parts = SystemParts::new(SharedStore::new(MemoryStore::new()), Box::new(late.clone()));
    let system = firmware
        .boot(ResetReason::Software, parts, SystemConfig::fast(), &caps)
        .unwrap();
    system.wait_ready(Duration::from_secs(5)).unwrap();
    assert!(late.calls().is_empty());
    assert!(system.i2c().is_some());

    firmware.shutdown().unwrap().destroy();
    assert!(firmware.system().is_none());
}

#[test]
fn scanner_loses_the_bus_when_the_system_goes() {
    let rig = Rig::new();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    let scanner = system.i2c_scanner().unwrap();
    assert!(scanner.device_present(0x48));
    assert_eq!(scanner.bus_scan(), vec![0x48]);

    system.destroy();
    assert!(!scanner.device_present(0x48));
    assert!(scanner.bus_scan().is_empty());
}

#[test]
fn wifi_link_loss_is_reported_to_the_system() {
    let rig = Rig::new().with_credentials();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    wait_for("wifi connection", || {
        system.wifi_state() == WifiConnState::ConnectedSta
    });

    rig.radio.drop_link();
    wait_for("link loss", || {
        system.wifi_state() == WifiConnState::Disconnected
    });
    assert!(rig.sink.contains("wifi", "link lost"));
    system.destroy();
}

#[test]
fn wifi_status_disconnect_and_auto_connect() {
    let rig = Rig::new().with_credentials();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    wait_for("wifi connection", || {
        system.wifi_state() == WifiConnState::ConnectedSta
    });
    let wifi = system.wifi().unwrap();
    let reply = ResponseChannel::new();

    let status = wifi
        .transact(Request::new(WifiOpcode::GetStatus), &reply, Duration::from_secs(1))
        .unwrap();
    assert_eq!(status.result, ResultCode::Data);
    assert_eq!(
        status.payload.as_slice(),
        &[WifiConnState::ConnectedSta as u8, 1]
    );

    assert!(wifi.get_task_handle().notify_with_retry(
        WifiNotify::CmdDisconnect,
        100,
        Duration::from_millis(2)
    ));
    wait_for("disconnect", || {
        system.wifi_state() == WifiConnState::Disconnected
    });
    let status = wifi
        .transact(Request::new(WifiOpcode::GetStatus), &reply, Duration::from_secs(1))
        .unwrap();
    assert_eq!(
        status.payload.as_slice(),
        &[WifiConnState::Disconnected as u8, 1]
    );

    let off = Request::new(WifiOpcode::SetAutoConnect)
        .payload(&[0])
        .unwrap();
    let ack = wifi.transact(off, &reply, Duration::from_secs(1)).unwrap();
    assert_eq!(ack.result, ResultCode::Ack);
    assert_eq!(rig.mem.get_u32("wifi", "autoConnect"), Some(0));
    system.destroy();

    // Next boot keeps the radio idle
    let again = rig.boot(ResetReason::Software, rig.full_parts());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(rig.radio.connects(), 1);
    assert_eq!(again.wifi_state(), WifiConnState::Disconnected);
    again.destroy();
}

#[test]
fn system_reports_wifi_state_and_saves_on_request() {
    let rig = Rig::new().with_credentials();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    wait_for("wifi connection", || {
        system.wifi_state() == WifiConnState::ConnectedSta
    });
    let handle = system.wait_ready(Duration::from_secs(1)).unwrap();
    let reply = ResponseChannel::new();

    let state = handle
        .transact(Request::new(SysOpcode::GetWifiState), &reply, Duration::from_secs(1))
        .unwrap();
    assert_eq!(state.result, ResultCode::Data);
    assert_eq!(state.payload.as_slice(), &[WifiConnState::ConnectedSta as u8]);

    let saved = handle
        .transact(Request::new(SysOpcode::SaveSettings), &reply, Duration::from_secs(1))
        .unwrap();
    assert_eq!(saved.result, ResultCode::Ack);
    assert_eq!(rig.mem.get_u32("system", "bootCount"), Some(1));
    assert_eq!(rig.mem.get_u32("system", "recoveryCount"), Some(0));
    system.destroy();
}

#[test]
fn spi_transfer_round_trip_through_the_system() {
    let rig = Rig::new();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    let spi = system.spi().unwrap();
    let reply = ResponseChannel::new();

    let write = Request::new(SpiOpcode::Transfer)
        .payload(&[0x10, 0xCA, 0xFE])
        .unwrap();
    let written = spi.transact(write, &reply, Duration::from_secs(1)).unwrap();
    assert_eq!(written.result, ResultCode::Data);

    let read = Request::new(SpiOpcode::Transfer)
        .payload(&[0x90, 0, 0])
        .unwrap();
    let response = spi.transact(read, &reply, Duration::from_secs(1)).unwrap();
    assert_eq!(response.result, ResultCode::Data);
    assert_eq!(response.payload.as_slice(), &[0x00, 0xCA, 0xFE]);
    system.destroy();
}

#[test]
fn full_teardown_skips_reports_to_an_exited_system() {
    let rig = Rig::new().with_credentials();
    let system = rig.boot(ResetReason::PowerOn, rig.full_parts());
    wait_for("wifi connection", || {
        system.wifi_state() == WifiConnState::ConnectedSta
    });

    system.destroy();
    assert!(rig.sink.contains("wifi", "System gone"));
    assert!(!rig.sink.contains("wifi", "System did not take"));
    assert!(!rig.radio.is_started());
}
