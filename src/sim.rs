// Simulated collaborators for the host build and tests.
// Each one is a cheap Clone over shared state so a test can keep a copy
// and inspect what the peripheral did with the boxed one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::Level;

use crate::display::Panel;
use crate::i2c::I2cBus;
use crate::protocol::BusError;
use crate::route_log::LogSink;
use crate::spi::SpiBus;
use crate::system::Platform;
use crate::wifi::{WifiCredentials, WifiRadio};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RegisterFile {
    registers: [u8; 256],
    pointer: u8,
}

impl RegisterFile {
    fn new() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
        }
    }

    fn write_from(&mut self, start: u8, data: &[u8]) {
        self.pointer = start;
        for byte in data {
            self.registers[self.pointer as usize] = *byte;
            self.pointer = self.pointer.wrapping_add(1);
        }
    }

    fn read_into(&mut self, buffer: &mut [u8]) {
        for byte in buffer.iter_mut() {
            *byte = self.registers[self.pointer as usize];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

#[derive(Default)]
struct I2cState {
    devices: HashMap<u8, RegisterFile>,
    fail_next: Option<BusError>,
    transactions: u32,
    latency: Duration,
}

/// I2C bus with register-file devices that echo what was written.
#[derive(Clone, Default)]
pub struct SimI2cBus {
    state: Arc<Mutex<I2cState>>,
}

impl SimI2cBus {
    pub fn with_devices(addresses: &[u8]) -> Self {
        let bus = Self::default();
        {
            let mut state = lock(&bus.state);
            for address in addresses {
                state.devices.insert(*address, RegisterFile::new());
            }
        }
        bus
    }

    /// Delay every transaction, to keep requests in flight during stress tests.
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// The next transaction fails with `err`.
    pub fn fail_next(&self, err: BusError) {
        lock(&self.state).fail_next = Some(err);
    }

    /// Number of read/write transactions attempted (probes excluded).
    pub fn transactions(&self) -> u32 {
        lock(&self.state).transactions
    }

    fn begin(&self, device: u8) -> Result<MutexGuard<'_, I2cState>, BusError> {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let mut state = lock(&self.state);
        state.transactions += 1;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if !state.devices.contains_key(&device) {
            return Err(BusError::Nak);
        }
        Ok(state)
    }
}

impl I2cBus for SimI2cBus {
    fn write(&mut self, device: u8, bytes: &[u8], _timeout: Duration) -> Result<(), BusError> {
        let mut state = self.begin(device)?;
        if let (Some(dev), Some((start, data))) = (state.devices.get_mut(&device), bytes.split_first()) {
            dev.write_from(*start, data);
        }
        Ok(())
    }

    fn read(&mut self, device: u8, buffer: &mut [u8], _timeout: Duration) -> Result<(), BusError> {
        let mut state = self.begin(device)?;
        if let Some(dev) = state.devices.get_mut(&device) {
            dev.read_into(buffer);
        }
        Ok(())
    }

    fn write_read(
        &mut self,
        device: u8,
        bytes: &[u8],
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<(), BusError> {
        let mut state = self.begin(device)?;
        if let Some(dev) = state.devices.get_mut(&device) {
            if let Some((start, data)) = bytes.split_first() {
                dev.write_from(*start, data);
            }
            dev.read_into(buffer);
        }
        Ok(())
    }

    fn probe(&mut self, device: u8, _timeout: Duration) -> bool {
        lock(&self.state).devices.contains_key(&device)
    }
}

#[derive(Default)]
struct SpiState {
    registers: Option<RegisterFile>,
    transfers: u32,
    fail_next: Option<BusError>,
    latency: Duration,
    last_timeout: Option<Duration>,
}

/// SPI device with a register map: command byte bit 7 set reads, clear writes.
#[derive(Clone, Default)]
pub struct SimSpiBus {
    state: Arc<Mutex<SpiState>>,
}

impl SimSpiBus {
    pub fn new() -> Self {
        let bus = Self::default();
        lock(&bus.state).registers = Some(RegisterFile::new());
        bus
    }

    pub fn fail_next(&self, err: BusError) {
        lock(&self.state).fail_next = Some(err);
    }

    /// Every transfer takes `latency`; one longer than its timeout fails with `Timeout`.
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    pub fn transfers(&self) -> u32 {
        lock(&self.state).transfers
    }

    /// Timeout passed with the most recent transfer.
    pub fn last_timeout(&self) -> Option<Duration> {
        lock(&self.state).last_timeout
    }
}

impl SpiBus for SimSpiBus {
    fn transfer(&mut self, read: &mut [u8], write: &[u8], timeout: Duration) -> Result<(), BusError> {
        let latency = {
            let mut state = lock(&self.state);
            state.last_timeout = Some(timeout);
            state.latency
        };
        if latency > timeout {
            thread::sleep(timeout);
            lock(&self.state).transfers += 1;
            return Err(BusError::Timeout);
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let mut state = lock(&self.state);
        state.transfers += 1;
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let Some(regs) = state.registers.as_mut() else {
            return Err(BusError::InvalidState);
        };
        read.fill(0);
        let Some((command, data)) = write.split_first() else {
            return Ok(());
        };
        let register = command & 0x7F;
        if command & 0x80 != 0 {
            regs.pointer = register;
            if let Some((_, rest)) = read.split_first_mut() {
                regs.read_into(rest);
            }
        } else {
            regs.write_from(register, data);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RadioState {
    networks: HashMap<String, String>,
    started: bool,
    connected: bool,
    connects: u32,
}

/// Radio that joins any network it was told about.
#[derive(Clone, Default)]
pub struct SimRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimRadio {
    pub fn with_network(ssid: &str, password: &str) -> Self {
        let radio = Self::default();
        lock(&radio.state)
            .networks
            .insert(ssid.to_string(), password.to_string());
        radio
    }

    /// Simulate the access point dropping the station.
    pub fn drop_link(&self) {
        lock(&self.state).connected = false;
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }
}

impl WifiRadio for SimRadio {
    fn start(&mut self) -> Result<()> {
        lock(&self.state).started = true;
        Ok(())
    }

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.started {
            return Err(anyhow!("radio not started"));
        }
        state.connects += 1;
        match state.networks.get(&credentials.ssid) {
            Some(password) if *password == credentials.password => {
                state.connected = true;
                Ok(())
            }
            Some(_) => Err(anyhow!("authentication failed for '{}'", credentials.ssid)),
            None => Err(anyhow!("network '{}' not found", credentials.ssid)),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        lock(&self.state).connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.started = false;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PanelState {
    pub initialized: bool,
    pub powered: bool,
    pub brightness: u8,
}

/// Display panel that only records what it was told.
#[derive(Clone, Default)]
pub struct SimPanel {
    state: Arc<Mutex<PanelState>>,
}

impl SimPanel {
    pub fn state(&self) -> PanelState {
        *lock(&self.state)
    }
}

impl Panel for SimPanel {
    fn init(&mut self) -> Result<()> {
        lock(&self.state).initialized = true;
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<(), BusError> {
        lock(&self.state).powered = on;
        Ok(())
    }

    fn set_brightness(&mut self, level: u8) -> Result<(), BusError> {
        lock(&self.state).brightness = level;
        Ok(())
    }
}

/// Platform bring-up that records each call in order.
#[derive(Clone, Default)]
pub struct SimPlatform {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_on: Option<&'static str>,
}

impl SimPlatform {
    /// Fail the bring-up call named `step`.
    pub fn failing_on(step: &'static str) -> Self {
        Self {
            fail_on: Some(step),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    fn record(&mut self, step: &'static str) -> Result<()> {
        lock(&self.calls).push(step);
        if self.fail_on == Some(step) {
            return Err(anyhow!("{} failed", step));
        }
        Ok(())
    }
}

impl Platform for SimPlatform {
    fn power_down_unused(&mut self) -> Result<()> {
        self.record("power_down_unused")
    }

    fn power_up_required(&mut self) -> Result<()> {
        self.record("power_up_required")
    }

    fn start_network_interface(&mut self) -> Result<()> {
        self.record("start_network_interface")
    }

    fn create_default_event_loop(&mut self) -> Result<()> {
        self.record("create_default_event_loop")
    }

    fn start_gpio(&mut self) -> Result<()> {
        self.record("start_gpio")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub tag: String,
    pub message: String,
}

/// Log sink that keeps every line for later assertions.
#[derive(Clone, Default)]
pub struct CaptureSink {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl CaptureSink {
    pub fn lines(&self) -> Vec<LogLine> {
        lock(&self.lines).clone()
    }

    pub fn contains(&self, tag: &str, needle: &str) -> bool {
        lock(&self.lines)
            .iter()
            .any(|l| l.tag == tag && l.message.contains(needle))
    }
}

impl LogSink for CaptureSink {
    fn log(&self, level: Level, tag: &str, message: &str) {
        lock(&self.lines).push(LogLine {
            level,
            tag: tag.to_string(),
            message: message.to_string(),
        });
    }
}
