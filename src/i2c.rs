// I2C peripheral
// Serves register/immediate reads and writes for every device on one master bus.
// The bus driver itself is a collaborator created during Init.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// Import anyhow for setup failures
use anyhow::{anyhow, Result};

use crate::notification::NotifyCode;
use crate::protocol::{status, BusError, Opcode, Request, Response, ResultCode, PAYLOAD_CAPACITY};
use crate::route_log::{log_task_info, RouteLog, ShowFlags};
use crate::settings::{restore_stack_size_k, SharedStore};
use crate::state_machine::{Peripheral, StepOutcome, TaskEnv, Transition};

const NVS_NAMESPACE: &str = "i2c";
const DEFAULT_STACK_K: u32 = 10;
const SCAN_PROBE_TIMEOUT: Duration = Duration::from_millis(100);
// 7-bit addresses outside the reserved ranges
const SCAN_FIRST: u8 = 0x03;
const SCAN_LAST: u8 = 0x77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cConfig {
    pub port: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    pub clock_hz: u32,
    /// Per-transaction timeout unless a request supplies its own.
    pub timeout: Duration,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            port: 0,
            sda_pin: 6,
            scl_pin: 7,
            clock_hz: 400_000,
            timeout: Duration::from_millis(500),
        }
    }
}

/// Synchronous master-bus transactions with a per-call timeout.
pub trait I2cBus: Send {
    fn write(&mut self, device: u8, bytes: &[u8], timeout: Duration) -> Result<(), BusError>;
    fn read(&mut self, device: u8, buffer: &mut [u8], timeout: Duration) -> Result<(), BusError>;
    fn write_read(
        &mut self,
        device: u8,
        bytes: &[u8],
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<(), BusError>;
    /// Address-only transaction; true when the device acknowledges.
    fn probe(&mut self, device: u8, timeout: Duration) -> bool;
}

/// Builds the bus driver during the CreateBus init step.
pub type I2cBusFactory = Box<dyn FnOnce(&I2cConfig) -> Result<Box<dyn I2cBus>> + Send>;

type SharedBus = Arc<Mutex<Option<Box<dyn I2cBus>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cOpcode {
    ReadRegAddr,
    WriteRegAddr,
    ReadImmediate,
    WriteImmediate,
}

impl Opcode for I2cOpcode {
    fn requires_payload(self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum I2cNotify {
    CmdScan = 1,
    CmdLogTaskInfo = 2,
    CmdShutDown = 3,
}

impl NotifyCode for I2cNotify {
    const SHUT_DOWN: Self = I2cNotify::CmdShutDown;

    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(I2cNotify::CmdScan),
            2 => Some(I2cNotify::CmdLogTaskInfo),
            3 => Some(I2cNotify::CmdShutDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cStep {
    LoadSettings,
    CreateBus,
    Scan,
}

/// Direct bus access for quick diagnostics, bypassing the mailbox.
#[derive(Clone)]
pub struct I2cScanner {
    bus: SharedBus,
    config: I2cConfig,
    log: Option<RouteLog>,
}

impl I2cScanner {
    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn I2cBus>>> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_log(mut self, log: RouteLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn device_present(&self, device: u8) -> bool {
        match self.lock().as_mut() {
            Some(bus) => bus.probe(device, SCAN_PROBE_TIMEOUT),
            None => false,
        }
    }

    /// Probe every usable address, log the classic 16-column table, return responders.
    pub fn bus_scan(&self) -> Vec<u8> {
        let mut found = Vec::new();
        let mut table = String::from("     0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f\n00:         ");
        {
            let mut guard = self.lock();
            let Some(bus) = guard.as_mut() else {
                return found;
            };
            for address in SCAN_FIRST..=SCAN_LAST {
                if address % 16 == 0 {
                    let _ = write!(table, "\n{:02x}:", address);
                }
                if bus.probe(address, SCAN_PROBE_TIMEOUT) {
                    let _ = write!(table, " {:02X}", address);
                    found.push(address);
                } else {
                    table.push_str(" --");
                }
            }
        }
        if let Some(log) = &self.log {
            log.info(format_args!(
                "🔎 Data Pin: {}, Clock Pin: {}, Port Speed: {}\n{}\n   Found {} Active Devices",
                self.config.sda_pin,
                self.config.scl_pin,
                self.config.clock_hz,
                table,
                found.len()
            ));
        }
        found
    }
}

/// I2C adapter run by the peripheral task.
pub struct I2c {
    store: SharedStore,
    config: I2cConfig,
    factory: Option<I2cBusFactory>,
    bus: SharedBus,
    run_stack_size_k: u32,
}

impl I2c {
    pub fn new(store: SharedStore, config: I2cConfig, factory: I2cBusFactory) -> Self {
        Self {
            store,
            config,
            factory: Some(factory),
            bus: Arc::new(Mutex::new(None)),
            run_stack_size_k: DEFAULT_STACK_K,
        }
    }

    /// Scanner sharing this adapter's bus; usable once Init has created the bus.
    pub fn scanner(&self) -> I2cScanner {
        I2cScanner {
            bus: Arc::clone(&self.bus),
            config: self.config,
            log: None,
        }
    }

    // Deletes the driver; scanners handed out earlier find no bus from here on
    fn close_bus(&self) -> bool {
        self.bus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    fn transact(&mut self, request: &Request<I2cOpcode>) -> Response {
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let device = request.device;
        let register = request.sub_address;
        let len = request.payload.len();

        let mut guard = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(bus) = guard.as_mut() else {
            return Response::from_bus_error(register, &BusError::InvalidState);
        };

        let result = match request.opcode {
            I2cOpcode::ReadRegAddr => {
                let mut data = request.payload;
                data.as_mut_slice().fill(0);
                bus.write_read(device, &[register], data.as_mut_slice(), timeout)
                    .map(|()| Response::data(register, data))
            }
            I2cOpcode::WriteRegAddr => {
                let mut frame = [0u8; PAYLOAD_CAPACITY + 1];
                frame[0] = register;
                frame[1..=len].copy_from_slice(request.payload.as_slice());
                bus.write(device, &frame[..=len], timeout)
                    .map(|()| Response::ack(register))
            }
            I2cOpcode::ReadImmediate => {
                let mut data = request.payload;
                data.as_mut_slice().fill(0);
                bus.read(device, data.as_mut_slice(), timeout)
                    .map(|()| Response::data(register, data))
            }
            I2cOpcode::WriteImmediate => bus
                .write(device, request.payload.as_slice(), timeout)
                .map(|()| Response::ack(register)),
        };

        result.unwrap_or_else(|e| Response::from_bus_error(register, &e))
    }
}

impl Peripheral for I2c {
    type Opcode = I2cOpcode;
    type Notify = I2cNotify;
    type Step = I2cStep;

    const TAG: &'static str = "i2c";
    const TASK_NAME: &'static str = "i2c_run";
    const INIT_STEPS: &'static [(I2cStep, Transition)] = &[
        (I2cStep::LoadSettings, Transition::Immediate),
        (I2cStep::CreateBus, Transition::Yield),
        (I2cStep::Scan, Transition::Yield),
    ];

    fn restore_settings(&mut self, log: &RouteLog) {
        self.run_stack_size_k = restore_stack_size_k(
            &self.store,
            NVS_NAMESPACE,
            DEFAULT_STACK_K,
            log,
            ShowFlags::default(),
        );
    }

    fn run_stack_size_k(&self) -> u32 {
        self.run_stack_size_k
    }

    fn init_step(&mut self, step: I2cStep, env: &mut TaskEnv) -> Result<StepOutcome> {
        match step {
            I2cStep::LoadSettings => {
                if env.show.contains(ShowFlags::INIT) {
                    env.log.info(format_args!(
                        "port={} sda={} scl={} clock={}Hz timeout={:?}",
                        self.config.port,
                        self.config.sda_pin,
                        self.config.scl_pin,
                        self.config.clock_hz,
                        self.config.timeout
                    ));
                }
            }
            I2cStep::CreateBus => {
                let factory = self
                    .factory
                    .take()
                    .ok_or_else(|| anyhow!("bus already created"))?;
                let bus = factory(&self.config)?;
                *self.bus.lock().unwrap_or_else(PoisonError::into_inner) = Some(bus);
            }
            I2cStep::Scan => {
                self.scanner().with_log(env.log.clone()).bus_scan();
            }
        }
        Ok(StepOutcome::Done)
    }

    fn on_notify(&mut self, code: I2cNotify, env: &mut TaskEnv) {
        match code {
            I2cNotify::CmdScan => {
                self.scanner().with_log(env.log.clone()).bus_scan();
            }
            I2cNotify::CmdLogTaskInfo => log_task_info(&env.log, env.task_info.as_ref()),
            I2cNotify::CmdShutDown => {}
        }
    }

    fn handle_request(&mut self, request: &Request<I2cOpcode>, env: &mut TaskEnv) -> Response {
        let response = self.transact(request);
        let failed = matches!(response.result, ResultCode::Nak | ResultCode::Error);
        if failed && (env.show.contains(ShowFlags::RUN) || request.debug) {
            env.log.warn(format_args!(
                "⚠️ {:?} dev=0x{:02X} reg=0x{:02X} failed rc=0x{:02X}",
                request.opcode,
                request.device,
                request.sub_address,
                response.code().unwrap_or(status::FAIL)
            ));
        }
        response
    }

    fn release(&mut self, log: &RouteLog) {
        if self.close_bus() {
            log.debug("Bus driver deleted");
        }
    }
}

// Also reached when the task panicked and never handed the adapter back
impl Drop for I2c {
    fn drop(&mut self) {
        self.close_bus();
    }
}

#[cfg(target_os = "espidf")]
mod esp {
    use std::time::Duration;

    use anyhow::Result;
    use esp_idf_hal::delay::TickType;
    use esp_idf_hal::gpio::{InputPin, OutputPin};
    use esp_idf_hal::i2c::{config::Config, I2c as I2cPeripheralTrait, I2cDriver};
    use esp_idf_hal::peripheral::Peripheral;
    use esp_idf_hal::units::Hertz;
    use esp_idf_svc::sys::EspError;

    use super::{I2cBus, I2cConfig};
    use crate::protocol::BusError;

    /// I2C master driver on an ESP32 port.
    pub struct EspI2cBus {
        driver: I2cDriver<'static>,
    }

    impl EspI2cBus {
        pub fn new(
            i2c: impl Peripheral<P = impl I2cPeripheralTrait> + 'static,
            sda: impl Peripheral<P = impl InputPin + OutputPin> + 'static,
            scl: impl Peripheral<P = impl InputPin + OutputPin> + 'static,
            config: &I2cConfig,
        ) -> Result<Self> {
            let driver_config = Config::new()
                .baudrate(Hertz(config.clock_hz))
                .sda_enable_pullup(true)
                .scl_enable_pullup(true);
            let driver = I2cDriver::new(i2c, sda, scl, &driver_config)?;
            Ok(Self { driver })
        }
    }

    fn ticks(timeout: Duration) -> u32 {
        TickType::from(timeout).ticks()
    }

    fn bus_error(e: EspError) -> BusError {
        match e.code() {
            esp_idf_svc::sys::ESP_ERR_TIMEOUT => BusError::Timeout,
            esp_idf_svc::sys::ESP_ERR_INVALID_ARG => BusError::InvalidArg,
            esp_idf_svc::sys::ESP_ERR_INVALID_STATE => BusError::InvalidState,
            esp_idf_svc::sys::ESP_ERR_NOT_FOUND => BusError::Nak,
            code => BusError::Driver(code),
        }
    }

    impl I2cBus for EspI2cBus {
        fn write(&mut self, device: u8, bytes: &[u8], timeout: Duration) -> Result<(), BusError> {
            self.driver
                .write(device, bytes, ticks(timeout))
                .map_err(bus_error)
        }

        fn read(&mut self, device: u8, buffer: &mut [u8], timeout: Duration) -> Result<(), BusError> {
            self.driver
                .read(device, buffer, ticks(timeout))
                .map_err(bus_error)
        }

        fn write_read(
            &mut self,
            device: u8,
            bytes: &[u8],
            buffer: &mut [u8],
            timeout: Duration,
        ) -> Result<(), BusError> {
            self.driver
                .write_read(device, bytes, buffer, ticks(timeout))
                .map_err(bus_error)
        }

        fn probe(&mut self, device: u8, timeout: Duration) -> bool {
            self.driver.write(device, &[], ticks(timeout)).is_ok()
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspI2cBus;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::TaskRef;
    use crate::notification::Notifier;
    use crate::route_log::{FacadeSink, StdTaskInfo};
    use crate::settings::MemoryStore;
    use crate::sim::SimI2cBus;
    use crate::state_machine::{Cadence, CadenceProfile};

    const DEV: u8 = 0x68;

    fn env() -> TaskEnv {
        TaskEnv {
            log: RouteLog::new("i2c", Arc::new(FacadeSink)),
            task_info: Arc::new(StdTaskInfo),
            show: ShowFlags::empty(),
            cadence: Cadence::new(CadenceProfile::default()),
            task: TaskRef::new("i2c_run", Arc::new(Notifier::new())),
        }
    }

    fn ready(sim: &SimI2cBus) -> (I2c, TaskEnv) {
        let sim = sim.clone();
        let mut i2c = I2c::new(
            SharedStore::new(MemoryStore::new()),
            I2cConfig::default(),
            Box::new(move |_: &I2cConfig| Ok(Box::new(sim) as Box<dyn I2cBus>)),
        );
        let mut env = env();
        for (step, _) in I2c::INIT_STEPS {
            assert_eq!(i2c.init_step(*step, &mut env).unwrap(), StepOutcome::Done);
        }
        (i2c, env)
    }

    #[test]
    fn register_write_then_read_echoes() {
        let sim = SimI2cBus::with_devices(&[DEV]);
        let (mut i2c, mut env) = ready(&sim);

        let write = Request::new(I2cOpcode::WriteRegAddr)
            .device(DEV)
            .register(0x10)
            .payload(&[1, 2, 3])
            .unwrap();
        let ack = i2c.handle_request(&write, &mut env);
        assert_eq!(ack.result, ResultCode::Ack);
        assert_eq!(ack.code(), Some(status::OK));

        let read = Request::new(I2cOpcode::ReadRegAddr)
            .device(DEV)
            .register(0x10)
            .read_len(3)
            .unwrap();
        let data = i2c.handle_request(&read, &mut env);
        assert_eq!(data.result, ResultCode::Data);
        assert_eq!(data.sub_address, 0x10);
        assert_eq!(data.payload.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn absent_device_naks() {
        let sim = SimI2cBus::with_devices(&[DEV]);
        let (mut i2c, mut env) = ready(&sim);
        let read = Request::new(I2cOpcode::ReadImmediate)
            .device(0x42)
            .read_len(1)
            .unwrap();
        let r = i2c.handle_request(&read, &mut env);
        assert_eq!(r.result, ResultCode::Nak);
        assert_eq!(r.payload.len(), 1);
    }

    #[test]
    fn driver_failure_becomes_error_response() {
        let sim = SimI2cBus::with_devices(&[DEV]);
        let (mut i2c, mut env) = ready(&sim);
        sim.fail_next(BusError::Timeout);
        let write = Request::new(I2cOpcode::WriteImmediate)
            .device(DEV)
            .payload(&[9])
            .unwrap();
        let r = i2c.handle_request(&write, &mut env);
        assert_eq!(r.result, ResultCode::Error);
        assert_eq!(r.code(), Some(status::TIMEOUT));
    }

    #[test]
    fn scan_finds_simulated_devices() {
        let sim = SimI2cBus::with_devices(&[0x3C, DEV]);
        let (i2c, _env) = ready(&sim);
        assert_eq!(i2c.scanner().bus_scan(), vec![0x3C, DEV]);
        assert!(i2c.scanner().device_present(0x3C));
        assert!(!i2c.scanner().device_present(0x50));
    }

    #[test]
    fn released_bus_is_gone_for_every_scanner() {
        let sim = SimI2cBus::with_devices(&[DEV]);
        let (mut i2c, mut env) = ready(&sim);
        let scanner = i2c.scanner();
        assert!(scanner.device_present(DEV));

        i2c.release(&env.log);
        assert!(!scanner.device_present(DEV));
        assert!(scanner.bus_scan().is_empty());

        let read = Request::new(I2cOpcode::ReadImmediate).device(DEV).read_len(1).unwrap();
        assert_eq!(
            i2c.handle_request(&read, &mut env).code(),
            Some(status::INVALID_STATE)
        );
    }

    #[test]
    fn dropping_the_adapter_deletes_the_driver() {
        let sim = SimI2cBus::with_devices(&[DEV]);
        let (i2c, _env) = ready(&sim);
        let scanner = i2c.scanner();
        drop(i2c);
        assert!(!scanner.device_present(DEV));
    }

    #[test]
    fn requests_before_bus_exists_report_invalid_state() {
        let mut i2c = I2c::new(
            SharedStore::new(MemoryStore::new()),
            I2cConfig::default(),
            Box::new(|_: &I2cConfig| Err(anyhow!("no bus"))),
        );
        let read = Request::new(I2cOpcode::ReadImmediate).device(DEV).read_len(1).unwrap();
        let r = i2c.handle_request(&read, &mut env());
        assert_eq!(r.code(), Some(status::INVALID_STATE));
    }
}
