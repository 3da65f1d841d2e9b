// SPI peripheral
// Full-duplex transfers and register access on one device of an SPI host.

use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::notification::NotifyCode;
use crate::protocol::{BusError, Opcode, Payload, Request, Response, PAYLOAD_CAPACITY};
use crate::route_log::{log_task_info, RouteLog, ShowFlags};
use crate::settings::{restore_stack_size_k, SharedStore};
use crate::state_machine::{Peripheral, StepOutcome, TaskEnv, Transition};

const NVS_NAMESPACE: &str = "spi";
const DEFAULT_STACK_K: u32 = 10;
// Register commands carry the direction in bit 7
const READ_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiConfig {
    pub host: u8,
    pub sclk_pin: u8,
    pub mosi_pin: u8,
    pub miso_pin: u8,
    pub cs_pin: u8,
    pub clock_hz: u32,
    pub max_transfer: usize,
    /// Per-transaction timeout unless a request supplies its own.
    pub timeout: Duration,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            host: 2,
            sclk_pin: 12,
            mosi_pin: 11,
            miso_pin: 13,
            cs_pin: 10,
            clock_hz: 10_000_000,
            max_transfer: PAYLOAD_CAPACITY,
            timeout: Duration::from_millis(500),
        }
    }
}

/// One full-duplex transaction: `write` is clocked out while `read` is filled.
pub trait SpiBus: Send {
    fn transfer(&mut self, read: &mut [u8], write: &[u8], timeout: Duration)
        -> Result<(), BusError>;
}

pub type SpiBusFactory = Box<dyn FnOnce(&SpiConfig) -> Result<Box<dyn SpiBus>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiOpcode {
    /// Payload is clocked out, the same number of bytes comes back.
    Transfer,
    WriteRegAddr,
    ReadRegAddr,
}

impl Opcode for SpiOpcode {
    fn requires_payload(self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SpiNotify {
    CmdLogTaskInfo = 1,
    CmdShutDown = 2,
}

impl NotifyCode for SpiNotify {
    const SHUT_DOWN: Self = SpiNotify::CmdShutDown;

    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(SpiNotify::CmdLogTaskInfo),
            2 => Some(SpiNotify::CmdShutDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiStep {
    LoadSettings,
    InitBus,
}

pub struct Spi {
    store: SharedStore,
    config: SpiConfig,
    factory: Option<SpiBusFactory>,
    bus: Option<Box<dyn SpiBus>>,
    run_stack_size_k: u32,
}

impl Spi {
    pub fn new(store: SharedStore, config: SpiConfig, factory: SpiBusFactory) -> Self {
        Self {
            store,
            config,
            factory: Some(factory),
            bus: None,
            run_stack_size_k: DEFAULT_STACK_K,
        }
    }

    fn transact(&mut self, request: &Request<SpiOpcode>) -> Result<Response, BusError> {
        let register = request.sub_address;
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let bus = self.bus.as_mut().ok_or(BusError::InvalidState)?;
        let data = request.payload.as_slice();
        if data.len() > self.config.max_transfer {
            return Err(BusError::InvalidArg);
        }

        // Command byte plus payload
        let mut tx = [0u8; PAYLOAD_CAPACITY + 1];
        let mut rx = [0u8; PAYLOAD_CAPACITY + 1];

        match request.opcode {
            SpiOpcode::Transfer => {
                let mut out = request.payload;
                bus.transfer(out.as_mut_slice(), data, timeout)?;
                Ok(Response::data(register, out))
            }
            SpiOpcode::WriteRegAddr => {
                tx[0] = register & !READ_BIT;
                tx[1..=data.len()].copy_from_slice(data);
                bus.transfer(&mut rx[..=data.len()], &tx[..=data.len()], timeout)?;
                Ok(Response::ack(register))
            }
            SpiOpcode::ReadRegAddr => {
                let len = data.len();
                tx[0] = register | READ_BIT;
                bus.transfer(&mut rx[..=len], &tx[..=len], timeout)?;
                let payload = Payload::from_slice(&rx[1..=len]).map_err(|_| BusError::InvalidArg)?;
                Ok(Response::data(register, payload))
            }
        }
    }
}

impl Peripheral for Spi {
    type Opcode = SpiOpcode;
    type Notify = SpiNotify;
    type Step = SpiStep;

    const TAG: &'static str = "spi";
    const TASK_NAME: &'static str = "spi_run";
    const INIT_STEPS: &'static [(SpiStep, Transition)] = &[
        (SpiStep::LoadSettings, Transition::Immediate),
        (SpiStep::InitBus, Transition::Yield),
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

    fn init_step(&mut self, step: SpiStep, env: &mut TaskEnv) -> Result<StepOutcome> {
        match step {
            SpiStep::LoadSettings => {
                if env.show.contains(ShowFlags::INIT) {
                    env.log.info(format_args!(
                        "host={} sclk={} mosi={} miso={} cs={} clock={}Hz",
                        self.config.host,
                        self.config.sclk_pin,
                        self.config.mosi_pin,
                        self.config.miso_pin,
                        self.config.cs_pin,
                        self.config.clock_hz
                    ));
                }
            }
            SpiStep::InitBus => {
                let factory = self
                    .factory
                    .take()
                    .ok_or_else(|| anyhow!("bus already initialized"))?;
                self.bus = Some(factory(&self.config)?);
            }
        }
        Ok(StepOutcome::Done)
    }

    fn on_notify(&mut self, code: SpiNotify, env: &mut TaskEnv) {
        if code == SpiNotify::CmdLogTaskInfo {
            log_task_info(&env.log, env.task_info.as_ref());
        }
    }

    fn handle_request(&mut self, request: &Request<SpiOpcode>, env: &mut TaskEnv) -> Response {
        self.transact(request).unwrap_or_else(|e| {
            if env.show.contains(ShowFlags::RUN) || request.debug {
                env.log.warn(format_args!("⚠️ {:?} failed: {}", request.opcode, e));
            }
            Response::from_bus_error(request.sub_address, &e)
        })
    }

    fn release(&mut self, log: &RouteLog) {
        if self.bus.take().is_some() {
            log.debug("Bus driver deleted");
        }
    }
}

#[cfg(target_os = "espidf")]
mod esp {
    use std::time::{Duration, Instant};

    use anyhow::Result;
    use esp_idf_hal::gpio::{InputPin, OutputPin};
    use esp_idf_hal::peripheral::Peripheral;
    use esp_idf_hal::spi::{config, SpiAnyPins, SpiDeviceDriver, SpiDriver, SpiDriverConfig};
    use esp_idf_hal::units::Hertz;

    use super::{SpiBus, SpiConfig};
    use crate::protocol::BusError;

    /// SPI device on an ESP32 SPI host.
    pub struct EspSpiBus {
        device: SpiDeviceDriver<'static, SpiDriver<'static>>,
    }

    impl EspSpiBus {
        pub fn new(
            spi: impl Peripheral<P = impl SpiAnyPins> + 'static,
            sclk: impl Peripheral<P = impl OutputPin> + 'static,
            mosi: impl Peripheral<P = impl OutputPin> + 'static,
            miso: impl Peripheral<P = impl InputPin> + 'static,
            cs: impl Peripheral<P = impl OutputPin> + 'static,
            config: &SpiConfig,
        ) -> Result<Self> {
            let driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &SpiDriverConfig::new())?;
            let device_config = config::Config::new().baudrate(Hertz(config.clock_hz));
            let device = SpiDeviceDriver::new(driver, Some(cs), &device_config)?;
            Ok(Self { device })
        }
    }

    impl SpiBus for EspSpiBus {
        // The polling transfer has no deadline of its own; an overrun reports as a timeout
        fn transfer(
            &mut self,
            read: &mut [u8],
            write: &[u8],
            timeout: Duration,
        ) -> Result<(), BusError> {
            let started = Instant::now();
            self.device
                .transfer(read, write)
                .map_err(|e| BusError::Driver(e.code()))?;
            if started.elapsed() > timeout {
                return Err(BusError::Timeout);
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspSpiBus;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lifecycle::TaskRef;
    use crate::notification::Notifier;
    use crate::protocol::{status, ResultCode};
    use crate::route_log::{FacadeSink, StdTaskInfo};
    use crate::settings::MemoryStore;
    use crate::sim::SimSpiBus;
    use crate::state_machine::{Cadence, CadenceProfile};

    fn ready(sim: &SimSpiBus) -> (Spi, TaskEnv) {
        let sim = sim.clone();
        let mut spi = Spi::new(
            SharedStore::new(MemoryStore::new()),
            SpiConfig::default(),
            Box::new(move |_: &SpiConfig| Ok(Box::new(sim) as Box<dyn SpiBus>)),
        );
        let mut env = TaskEnv {
            log: RouteLog::new("spi", Arc::new(FacadeSink)),
            task_info: Arc::new(StdTaskInfo),
            show: ShowFlags::empty(),
            cadence: Cadence::new(CadenceProfile::default()),
            task: TaskRef::new("spi_run", Arc::new(Notifier::new())),
        };
        for (step, _) in Spi::INIT_STEPS {
            spi.init_step(*step, &mut env).unwrap();
        }
        (spi, env)
    }

    #[test]
    fn register_round_trip() {
        let sim = SimSpiBus::new();
        let (mut spi, mut env) = ready(&sim);
        let w = Request::new(SpiOpcode::WriteRegAddr)
            .register(0x20)
            .payload(&[0xAA, 0x55])
            .unwrap();
        assert_eq!(spi.handle_request(&w, &mut env).result, ResultCode::Ack);
        let r = Request::new(SpiOpcode::ReadRegAddr)
            .register(0x20)
            .read_len(2)
            .unwrap();
        let resp = spi.handle_request(&r, &mut env);
        assert_eq!(resp.result, ResultCode::Data);
        assert_eq!(resp.payload.as_slice(), &[0xAA, 0x55]);
        assert_eq!(sim.transfers(), 2);
    }

    #[test]
    fn transfer_writes_then_reads_back_through_command_byte() {
        let sim = SimSpiBus::new();
        let (mut spi, mut env) = ready(&sim);
        let write = Request::new(SpiOpcode::Transfer)
            .payload(&[0x10, 0xDE, 0xAD, 0xBE])
            .unwrap();
        let echoed = spi.handle_request(&write, &mut env);
        assert_eq!(echoed.result, ResultCode::Data);
        assert_eq!(echoed.payload.as_slice(), &[0, 0, 0, 0]);

        let read = Request::new(SpiOpcode::Transfer)
            .payload(&[0x90, 0, 0, 0])
            .unwrap();
        let response = spi.handle_request(&read, &mut env);
        assert_eq!(response.result, ResultCode::Data);
        assert_eq!(response.payload.as_slice(), &[0, 0xDE, 0xAD, 0xBE]);
    }

    #[test]
    fn request_timeout_overrides_configured_timeout() {
        let sim = SimSpiBus::new().with_latency(Duration::from_millis(20));
        let (mut spi, mut env) = ready(&sim);

        let patient = Request::new(SpiOpcode::Transfer).payload(&[0x01, 7]).unwrap();
        assert_eq!(spi.handle_request(&patient, &mut env).result, ResultCode::Data);
        assert_eq!(sim.last_timeout(), Some(SpiConfig::default().timeout));

        let hurried = Request::new(SpiOpcode::Transfer)
            .payload(&[0x01, 7])
            .unwrap()
            .timeout(Duration::from_millis(5));
        let response = spi.handle_request(&hurried, &mut env);
        assert_eq!(response.result, ResultCode::Error);
        assert_eq!(response.code(), Some(status::TIMEOUT));
        assert_eq!(sim.last_timeout(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn release_deletes_the_driver() {
        let sim = SimSpiBus::new();
        let (mut spi, mut env) = ready(&sim);
        spi.release(&env.log);
        let t = Request::new(SpiOpcode::Transfer).payload(&[1]).unwrap();
        assert_eq!(
            spi.handle_request(&t, &mut env).code(),
            Some(status::INVALID_STATE)
        );
        assert_eq!(sim.transfers(), 0);
    }

    #[test]
    fn transfer_failure_reports_code() {
        let sim = SimSpiBus::new();
        let (mut spi, mut env) = ready(&sim);
        sim.fail_next(BusError::Timeout);
        let t = Request::new(SpiOpcode::Transfer).payload(&[1]).unwrap();
        let resp = spi.handle_request(&t, &mut env);
        assert_eq!(resp.result, ResultCode::Error);
        assert_eq!(resp.code(), Some(status::TIMEOUT));
    }
}
