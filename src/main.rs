// Firmware entry point
// On the device: real drivers plus an async connection-status task.
// On a host: the same boot sequence against simulated collaborators.

use periph_kernel::lifecycle::Capabilities;
use periph_kernel::system::{Firmware, SystemConfig};

#[cfg(target_os = "espidf")]
mod device {
    use std::sync::Arc;

    use anyhow::Result;
    // Import Embassy async runtime primitives
    use embassy_executor::Executor;
    use embassy_futures::select::{select, Either};
    use embassy_time::{Duration, Timer};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::info;

    use periph_kernel::display::LogPanel;
    use periph_kernel::i2c::{EspI2cBus, I2cBus, I2cConfig};
    use periph_kernel::settings::{EspNvsStore, SharedStore};
    use periph_kernel::spi::{EspSpiBus, SpiBus, SpiConfig};
    use periph_kernel::system::{ConnectionMonitor, EspPlatform, ResetReason, SystemParts};
    use periph_kernel::wifi::{EspWifiRadio, WifiConfig, WifiConnState, WifiRadio};

    use super::*;

    #[embassy_executor::task]
    async fn connection_status_task(monitor: Arc<ConnectionMonitor>) {
        info!("Connection status task started");
        let mut previous = monitor.get();
        loop {
            match select(monitor.wait_change(), Timer::after(Duration::from_secs(60))).await {
                Either::First(state) => {
                    if state != previous {
                        match state {
                            WifiConnState::ConnectedSta => info!("🟢 WiFi connected"),
                            WifiConnState::ConnectingSta => info!("🔵 WiFi connecting"),
                            WifiConnState::DisconnectingSta => info!("🟡 WiFi disconnecting"),
                            WifiConnState::Disconnected => info!("🔴 WiFi disconnected"),
                        }
                        previous = state;
                    }
                }
                Either::Second(()) => info!("Connection status: {:?}", monitor.get()),
            }
        }
    }

    pub fn run() -> Result<()> {
        // It is necessary to call this function once. Otherwise some patches to the runtime
        // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
        esp_idf_svc::sys::link_patches();

        // Bind the log crate to the ESP Logging facilities
        esp_idf_svc::log::EspLogger::initialize_default();

        let reset_reason = ResetReason::from_chip();
        info!("🚀 Starting firmware ({:?})", reset_reason);

        // Take the peripherals
        let peripherals = Peripherals::take()?;
        let sys_loop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;
        let store = SharedStore::new(EspNvsStore::new(nvs.clone()));
        let platform = EspPlatform::new(sys_loop);

        let i2c_port = peripherals.i2c0;
        let (sda, scl) = (peripherals.pins.gpio6, peripherals.pins.gpio7);
        let spi_host = peripherals.spi2;
        let (sclk, mosi, miso, cs) = (
            peripherals.pins.gpio12,
            peripherals.pins.gpio11,
            peripherals.pins.gpio13,
            peripherals.pins.gpio10,
        );
        let modem = peripherals.modem;
        let radio_loop = platform.event_loop();

        let parts = SystemParts::new(store, Box::new(platform))
            .with_i2c(
                I2cConfig::default(),
                Box::new(move |config: &I2cConfig| {
                    Ok(Box::new(EspI2cBus::new(i2c_port, sda, scl, config)?) as Box<dyn I2cBus>)
                }),
            )
            .with_spi(
                SpiConfig::default(),
                Box::new(move |config: &SpiConfig| {
                    Ok(Box::new(EspSpiBus::new(spi_host, sclk, mosi, miso, cs, config)?)
                        as Box<dyn SpiBus>)
                }),
            )
            .with_panel(Box::new(LogPanel))
            .with_wifi(
                WifiConfig::default(),
                Box::new(move || {
                    Ok(Box::new(EspWifiRadio::new(modem, radio_loop, nvs)?) as Box<dyn WifiRadio>)
                }),
            );

        // Lives for the rest of the program
        let firmware: &'static Firmware = Box::leak(Box::new(Firmware::new()));
        let system = firmware.boot(
            reset_reason,
            parts,
            SystemConfig::default(),
            &Capabilities::default(),
        )?;
        let monitor = system.monitor();

        let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
        executor.run(move |spawner| {
            if spawner.spawn(connection_status_task(monitor)).is_err() {
                log::error!("❌ Failed to spawn connection status task");
            }
        })
    }
}

#[cfg(not(target_os = "espidf"))]
mod host {
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use log::info;

    use periph_kernel::display::DisplayOpcode;
    use periph_kernel::i2c::{I2cBus, I2cConfig, I2cOpcode};
    use periph_kernel::lifecycle::TaskProfile;
    use periph_kernel::protocol::{Request, ResponseChannel};
    use periph_kernel::settings::{MemoryStore, SharedStore};
    use periph_kernel::sim::{SimI2cBus, SimPanel, SimPlatform, SimRadio, SimSpiBus};
    use periph_kernel::spi::{SpiBus, SpiConfig};
    use periph_kernel::system::{ResetReason, SystemParts};
    use periph_kernel::wifi::{store_credentials, WifiConfig, WifiCredentials, WifiRadio};

    use super::*;

    const SENSOR: u8 = 0x48;

    pub fn run() -> Result<()> {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        info!("🚀 Starting simulated boot");

        let store = SharedStore::new(MemoryStore::new());
        store_credentials(
            &store,
            &WifiCredentials {
                ssid: "bench".into(),
                password: "bench-password".into(),
            },
        )?;

        let bus = SimI2cBus::with_devices(&[SENSOR, 0x68]);
        let radio = SimRadio::with_network("bench", "bench-password");
        let parts = SystemParts::new(store, Box::new(SimPlatform::default()))
            .with_i2c(
                I2cConfig::default(),
                Box::new(move |_: &I2cConfig| Ok(Box::new(bus) as Box<dyn I2cBus>)),
            )
            .with_spi(
                SpiConfig::default(),
                Box::new(|_: &SpiConfig| Ok(Box::new(SimSpiBus::new()) as Box<dyn SpiBus>)),
            )
            .with_panel(Box::new(SimPanel::default()))
            .with_wifi(
                WifiConfig::default(),
                Box::new(move || Ok(Box::new(radio) as Box<dyn WifiRadio>)),
            );

        let mut firmware = Firmware::new();
        let caps = Capabilities::default().with_profile(TaskProfile::fast());
        let system = firmware.boot(ResetReason::PowerOn, parts, SystemConfig::fast(), &caps)?;
        system
            .wait_ready(Duration::from_secs(5))
            .ok_or_else(|| anyhow!("system did not become ready"))?;

        if let Some(scanner) = system.i2c_scanner() {
            scanner.bus_scan();
        }

        let i2c = system.i2c().ok_or_else(|| anyhow!("no I2C peripheral"))?;
        let reply = ResponseChannel::new();
        let write = Request::new(I2cOpcode::WriteRegAddr)
            .device(SENSOR)
            .register(0x10)
            .payload(&[0xDE, 0xAD])?;
        let ack = i2c.transact(write, &reply, Duration::from_secs(1));
        info!("Write -> {:?}", ack.map(|r| r.result));
        let read = Request::new(I2cOpcode::ReadRegAddr)
            .device(SENSOR)
            .register(0x10)
            .read_len(2)?;
        if let Some(response) = i2c.transact(read, &reply, Duration::from_secs(1)) {
            info!("Read -> {:?} {:?}", response.result, response.payload);
        }

        if let Some(display) = system.display() {
            let dim = Request::new(DisplayOpcode::SetBrightness).payload(&[64])?;
            display.transact(dim, &reply, Duration::from_secs(1));
        }

        std::thread::sleep(Duration::from_millis(100));
        info!("WiFi state: {:?}", system.wifi_state());

        if let Some(system) = firmware.shutdown() {
            system.destroy();
        }
        info!("👋 Simulated run finished");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    #[cfg(target_os = "espidf")]
    return device::run();
    #[cfg(not(target_os = "espidf"))]
    return host::run();
}
