// System coordinator
// Brings the platform up, creates every peripheral object in dependency order,
// tracks the Wi-Fi connection state, and tears children down in reverse order.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Result};

// Import Embassy synchronization primitives for async consumers of the connection state
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::signal::Signal;

use crate::display::{Display, DisplayOpcode, Panel};
use crate::entry_guard::EntryGuard;
use crate::i2c::{I2c, I2cBusFactory, I2cConfig, I2cOpcode, I2cScanner};
use crate::lifecycle::{Capabilities, PeripheralHandle, PeripheralObject, TaskRef};
use crate::notification::NotifyCode;
use crate::protocol::{status, Opcode, Payload, Request, Response};
use crate::route_log::{log_task_info, RouteLog, ShowFlags};
use crate::settings::{restore_stack_size_k, SharedStore};
use crate::spi::{Spi, SpiBusFactory, SpiConfig, SpiOpcode};
use crate::state_machine::{Mode, Peripheral, StepOutcome, TaskEnv, Transition};
use crate::wifi::{Wifi, WifiConfig, WifiConnState, WifiOpcode, WifiRadioFactory};

const NVS_NAMESPACE: &str = "system";
const BOOT_COUNT_KEY: &str = "bootCount";
const RECOVERY_COUNT_KEY: &str = "recoveryCount";
const DEFAULT_STACK_K: u32 = 12;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why the chip last came out of reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    DeepSleep,
    Software,
    Panic,
    Watchdog,
    Brownout,
    Unknown,
}

impl ResetReason {
    /// Abnormal resets run the recovery path on the way up.
    pub fn needs_recovery(self) -> bool {
        matches!(
            self,
            ResetReason::Panic | ResetReason::Watchdog | ResetReason::Brownout
        )
    }

    #[cfg(target_os = "espidf")]
    pub fn from_chip() -> Self {
        use esp_idf_sys::*;

        // SAFETY: reads a value latched by the ROM bootloader
        let reason = unsafe { esp_reset_reason() };
        match reason {
            esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
            esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleep,
            esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
            esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Panic,
            esp_reset_reason_t_ESP_RST_INT_WDT
            | esp_reset_reason_t_ESP_RST_TASK_WDT
            | esp_reset_reason_t_ESP_RST_WDT => ResetReason::Watchdog,
            esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
            _ => ResetReason::Unknown,
        }
    }
}

/// Board bring-up collaborator, called in this order before any peripheral exists.
pub trait Platform: Send {
    fn power_down_unused(&mut self) -> Result<()>;
    fn power_up_required(&mut self) -> Result<()>;
    fn start_network_interface(&mut self) -> Result<()>;
    fn create_default_event_loop(&mut self) -> Result<()>;
    fn start_gpio(&mut self) -> Result<()>;
}

/// Collaborators the System builds its children from. A missing one skips that child.
pub struct SystemParts {
    pub store: SharedStore,
    pub platform: Box<dyn Platform>,
    pub i2c: Option<(I2cConfig, I2cBusFactory)>,
    pub spi: Option<(SpiConfig, SpiBusFactory)>,
    pub panel: Option<Box<dyn Panel>>,
    pub wifi: Option<(WifiConfig, WifiRadioFactory)>,
}

impl SystemParts {
    pub fn new(store: SharedStore, platform: Box<dyn Platform>) -> Self {
        Self {
            store,
            platform,
            i2c: None,
            spi: None,
            panel: None,
            wifi: None,
        }
    }

    pub fn with_i2c(mut self, config: I2cConfig, factory: I2cBusFactory) -> Self {
        self.i2c = Some((config, factory));
        self
    }

    pub fn with_spi(mut self, config: SpiConfig, factory: SpiBusFactory) -> Self {
        self.spi = Some((config, factory));
        self
    }

    pub fn with_panel(mut self, panel: Box<dyn Panel>) -> Self {
        self.panel = Some(panel);
        self
    }

    pub fn with_wifi(mut self, config: WifiConfig, factory: WifiRadioFactory) -> Self {
        self.wifi = Some((config, factory));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    /// System timer period.
    pub timer_tick: Duration,
    pub ticks_per_second: u32,
    /// Seconds after Init/Finished before the boot counter is saved.
    pub boot_save_delay_s: u32,
    pub diagnostics_period_s: u32,
    pub heartbeat_period_s: u32,
    /// Entry guard wait per attempt while waiting on a child.
    pub child_wait: Duration,
    /// How long teardown waits for a child's entry guard.
    pub destroy_guard_wait: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            timer_tick: Duration::from_millis(100),
            ticks_per_second: 10,
            boot_save_delay_s: 2,
            diagnostics_period_s: 10,
            heartbeat_period_s: 60,
            child_wait: Duration::from_millis(100),
            destroy_guard_wait: Duration::from_secs(2),
        }
    }
}

impl SystemConfig {
    /// Millisecond timer for simulations and tests.
    pub fn fast() -> Self {
        Self {
            timer_tick: Duration::from_millis(1),
            child_wait: Duration::from_millis(20),
            destroy_guard_wait: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

/// Cross-object access to the System task reference, always under its own guard.
#[derive(Clone)]
pub struct SystemLink {
    guard: EntryGuard,
    task: Arc<Mutex<Option<TaskRef>>>,
}

impl Default for SystemLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLink {
    pub fn new() -> Self {
        Self {
            guard: EntryGuard::new(),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn publish(&self, task: TaskRef) {
        self.guard.take(None);
        *lock(&self.task) = Some(task);
        self.guard.give();
    }

    /// Stop handing out the task reference; the System task is about to exit.
    pub fn withdraw(&self) {
        self.guard.take(None);
        *lock(&self.task) = None;
        self.guard.give();
    }

    /// Copy the System task reference out; the guard is released immediately.
    pub fn system_task(&self, timeout: Duration) -> Option<TaskRef> {
        if !self.guard.take(Some(timeout)) {
            return None;
        }
        let task = lock(&self.task).clone();
        self.guard.give();
        task
    }
}

/// Latest Wi-Fi connection state, readable from threads and awaitable from async tasks.
pub struct ConnectionMonitor {
    state: BlockingMutex<CriticalSectionRawMutex, Cell<WifiConnState>>,
    changed: Signal<CriticalSectionRawMutex, WifiConnState>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub const fn new() -> Self {
        Self {
            state: BlockingMutex::new(Cell::new(WifiConnState::Disconnected)),
            changed: Signal::new(),
        }
    }

    pub fn set(&self, state: WifiConnState) {
        let previous = self.state.lock(|cell| cell.replace(state));
        if previous != state {
            self.changed.signal(state);
        }
    }

    pub fn get(&self) -> WifiConnState {
        self.state.lock(|cell| cell.get())
    }

    /// Wait for the next state change.
    pub async fn wait_change(&self) -> WifiConnState {
        self.changed.wait().await
    }

    pub fn try_take_change(&self) -> Option<WifiConnState> {
        self.changed.try_take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SysNotify {
    NfyWifiConnecting = 1,
    NfyWifiConnected = 2,
    NfyWifiDisconnecting = 3,
    NfyWifiDisconnected = 4,
    CmdDestroyWifi = 5,
    CmdLogTaskInfo = 6,
    CmdShutDown = 7,
}

impl NotifyCode for SysNotify {
    const SHUT_DOWN: Self = SysNotify::CmdShutDown;

    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(SysNotify::NfyWifiConnecting),
            2 => Some(SysNotify::NfyWifiConnected),
            3 => Some(SysNotify::NfyWifiDisconnecting),
            4 => Some(SysNotify::NfyWifiDisconnected),
            5 => Some(SysNotify::CmdDestroyWifi),
            6 => Some(SysNotify::CmdLogTaskInfo),
            7 => Some(SysNotify::CmdShutDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysOpcode {
    /// Data: [WifiConnState]
    GetWifiState,
    /// Data: boot counter, little endian u32
    GetBootCount,
    SaveSettings,
}

impl Opcode for SysOpcode {
    fn requires_payload(self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysStep {
    HandleResetReason,
    PowerDownUnused,
    PowerUpRequired,
    StartNetworkInterface,
    CreateEventLoop,
    StartGpio,
    CreateI2c,
    WaitI2c,
    CreateSpi,
    WaitSpi,
    CreateDisplay,
    WaitDisplay,
    CreateWifi,
    WaitWifi,
    StartSystemTimer,
}

/// Child handles copied out under each child's entry guard.
#[derive(Default)]
struct SystemHandles {
    i2c: Option<PeripheralHandle<I2cOpcode>>,
    i2c_scanner: Option<I2cScanner>,
    spi: Option<PeripheralHandle<SpiOpcode>>,
    display: Option<PeripheralHandle<DisplayOpcode>>,
    wifi: Option<PeripheralHandle<WifiOpcode>>,
}

#[derive(Default)]
struct TimerFlags {
    save_countdown: AtomicU32,
    save_requested: AtomicBool,
    diagnostics_requested: AtomicBool,
    stop: AtomicBool,
}

// Dedicated timer task; sets flags the System loop consumes in housekeeping
struct SysTimer {
    flags: Arc<TimerFlags>,
    thread: Option<JoinHandle<()>>,
}

impl SysTimer {
    fn start(config: SystemConfig, flags: Arc<TimerFlags>, log: RouteLog) -> Result<Self> {
        let thread = {
            let flags = Arc::clone(&flags);
            thread::Builder::new()
                .name("sys_tmr".to_string())
                .spawn(move || {
                    let mut ticks: u32 = 0;
                    let mut seconds: u32 = 0;
                    while !flags.stop.load(Ordering::Acquire) {
                        thread::sleep(config.timer_tick);
                        ticks += 1;
                        if ticks < config.ticks_per_second {
                            continue;
                        }
                        ticks = 0;
                        seconds = seconds.wrapping_add(1);

                        let countdown = flags.save_countdown.load(Ordering::Acquire);
                        if countdown > 0 {
                            flags.save_countdown.store(countdown - 1, Ordering::Release);
                            if countdown == 1 {
                                flags.save_requested.store(true, Ordering::Release);
                            }
                        }
                        if config.diagnostics_period_s > 0 && seconds % config.diagnostics_period_s == 0 {
                            flags.diagnostics_requested.store(true, Ordering::Release);
                        }
                        if config.heartbeat_period_s > 0 && seconds % config.heartbeat_period_s == 0 {
                            log.info(format_args!("💓 Uptime {}s", seconds));
                        }
                    }
                })
                .map_err(|e| anyhow!("failed to start system timer: {}", e))?
        };
        Ok(Self {
            flags,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        self.flags.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SysTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// System adapter run by the `sys_run` task.
pub struct SystemCore {
    reset_reason: ResetReason,
    config: SystemConfig,
    caps: Capabilities,
    store: SharedStore,
    platform: Box<dyn Platform>,
    pending_i2c: Option<(I2cConfig, I2cBusFactory)>,
    pending_spi: Option<(SpiConfig, SpiBusFactory)>,
    pending_panel: Option<Box<dyn Panel>>,
    pending_wifi: Option<(WifiConfig, WifiRadioFactory)>,
    i2c: Option<PeripheralObject<I2c>>,
    spi: Option<PeripheralObject<Spi>>,
    display: Option<PeripheralObject<Display>>,
    wifi: Option<PeripheralObject<Wifi>>,
    handles: Arc<Mutex<SystemHandles>>,
    link: SystemLink,
    monitor: Arc<ConnectionMonitor>,
    flags: Arc<TimerFlags>,
    timer: Option<SysTimer>,
    boot_count: u32,
    recovery_count: u32,
    run_stack_size_k: u32,
}

impl SystemCore {
    fn new(
        reset_reason: ResetReason,
        parts: SystemParts,
        config: SystemConfig,
        caps: Capabilities,
        link: SystemLink,
        handles: Arc<Mutex<SystemHandles>>,
        monitor: Arc<ConnectionMonitor>,
    ) -> Self {
        Self {
            reset_reason,
            config,
            caps,
            store: parts.store,
            platform: parts.platform,
            pending_i2c: parts.i2c,
            pending_spi: parts.spi,
            pending_panel: parts.panel,
            pending_wifi: parts.wifi,
            i2c: None,
            spi: None,
            display: None,
            wifi: None,
            handles,
            link,
            monitor,
            flags: Arc::new(TimerFlags::default()),
            timer: None,
            boot_count: 0,
            recovery_count: 0,
            run_stack_size_k: DEFAULT_STACK_K,
        }
    }

    fn save_counters(&self, env: &TaskEnv) -> Result<()> {
        let mut ns = self.store.namespace(NVS_NAMESPACE)?;
        ns.write_value(BOOT_COUNT_KEY, self.boot_count)?;
        ns.write_value(RECOVERY_COUNT_KEY, self.recovery_count)?;
        if env.show.contains(ShowFlags::NVS) {
            env.log.info(format_args!(
                "💾 bootCount={} recoveryCount={}",
                self.boot_count, self.recovery_count
            ));
        }
        Ok(())
    }

    // Returns the handle once the child is ready. A child parked in Error is skipped.
    fn wait_child<P: Peripheral>(
        child: &Option<PeripheralObject<P>>,
        wait: Duration,
        env: &TaskEnv,
    ) -> (StepOutcome, Option<PeripheralHandle<P::Opcode>>) {
        let Some(object) = child else {
            return (StepOutcome::Done, None);
        };
        if let Some(handle) = object.wait_ready(wait) {
            if env.show.contains(ShowFlags::INIT) {
                env.log.info(format_args!("✅ {} ready", P::TASK_NAME));
            }
            return (StepOutcome::Done, Some(handle));
        }
        match object.status().mode() {
            Mode::Error | Mode::Idle => {
                env.log.error(format_args!(
                    "❌ {} failed to start, continuing without it: {}",
                    P::TASK_NAME,
                    object.status().last_error().unwrap_or_default()
                ));
                (StepOutcome::Done, None)
            }
            _ => (StepOutcome::Pending, None),
        }
    }

    fn platform_step(&mut self, step: SysStep, env: &TaskEnv) -> Result<()> {
        let result = match step {
            SysStep::PowerDownUnused => self.platform.power_down_unused(),
            SysStep::PowerUpRequired => self.platform.power_up_required(),
            SysStep::StartNetworkInterface => self.platform.start_network_interface(),
            SysStep::CreateEventLoop => self.platform.create_default_event_loop(),
            SysStep::StartGpio => self.platform.start_gpio(),
            _ => Ok(()),
        };
        if result.is_ok() && env.show.contains(ShowFlags::INIT) {
            env.log.info(format_args!("{:?} done", step));
        }
        result
    }

    fn set_wifi_state(&mut self, state: WifiConnState, env: &TaskEnv) {
        if env.show.contains(ShowFlags::EVENTS) {
            env.log.info(format_args!("📶 WiFi {:?}", state));
        }
        self.monitor.set(state);
    }

    // Full teardown of the Wi-Fi object, inline on this task
    fn destroy_wifi(&mut self, env: &TaskEnv) {
        let Some(wifi) = self.wifi.take() else {
            env.log.warn("⚠️ WiFi not running");
            return;
        };
        if !wifi.lock_entry(self.config.destroy_guard_wait) {
            env.log.warn("⚠️ WiFi guard busy, destroying anyway");
        }
        lock(&self.handles).wifi = None;
        wifi.destroy();
        self.set_wifi_state(WifiConnState::Disconnected, env);
    }

    fn destroy_children(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }
        *lock(&self.handles) = SystemHandles::default();

        // Lock every child first so none hands out handles while its siblings go
        let wait = self.config.destroy_guard_wait;
        if let Some(wifi) = &self.wifi {
            wifi.lock_entry(wait);
        }
        if let Some(display) = &self.display {
            display.lock_entry(wait);
        }
        if let Some(spi) = &self.spi {
            spi.lock_entry(wait);
        }
        if let Some(i2c) = &self.i2c {
            i2c.lock_entry(wait);
        }

        if let Some(wifi) = self.wifi.take() {
            wifi.destroy();
        }
        if let Some(display) = self.display.take() {
            display.destroy();
        }
        if let Some(spi) = self.spi.take() {
            spi.destroy();
        }
        if let Some(i2c) = self.i2c.take() {
            i2c.destroy();
        }
        self.monitor.set(WifiConnState::Disconnected);
    }
}

impl Peripheral for SystemCore {
    type Opcode = SysOpcode;
    type Notify = SysNotify;
    type Step = SysStep;

    const TAG: &'static str = "system";
    const TASK_NAME: &'static str = "sys_run";
    const INIT_STEPS: &'static [(SysStep, Transition)] = &[
        (SysStep::HandleResetReason, Transition::Immediate),
        (SysStep::PowerDownUnused, Transition::Immediate),
        (SysStep::PowerUpRequired, Transition::Yield),
        (SysStep::StartNetworkInterface, Transition::Immediate),
        (SysStep::CreateEventLoop, Transition::Immediate),
        (SysStep::StartGpio, Transition::Yield),
        (SysStep::CreateI2c, Transition::Immediate),
        (SysStep::WaitI2c, Transition::Yield),
        (SysStep::CreateSpi, Transition::Immediate),
        (SysStep::WaitSpi, Transition::Yield),
        (SysStep::CreateDisplay, Transition::Immediate),
        (SysStep::WaitDisplay, Transition::Yield),
        (SysStep::CreateWifi, Transition::Immediate),
        (SysStep::WaitWifi, Transition::Yield),
        (SysStep::StartSystemTimer, Transition::Immediate),
    ];
    // Wi-Fi may report before the System itself reaches Run
    const NOTIFY_DURING_INIT: bool = true;

    fn restore_settings(&mut self, log: &RouteLog) {
        self.run_stack_size_k = restore_stack_size_k(
            &self.store,
            NVS_NAMESPACE,
            DEFAULT_STACK_K,
            log,
            ShowFlags::default(),
        );
        let restored = self.store.namespace(NVS_NAMESPACE).and_then(|mut ns| {
            Ok((
                ns.read_value(BOOT_COUNT_KEY, 0)?,
                ns.read_value(RECOVERY_COUNT_KEY, 0)?,
            ))
        });
        match restored {
            Ok((boot_count, recovery_count)) => {
                self.boot_count = boot_count;
                self.recovery_count = recovery_count;
            }
            Err(e) => log.warn(format_args!("⚠️ Counters not restored: {:#}", e)),
        }
    }

    fn run_stack_size_k(&self) -> u32 {
        self.run_stack_size_k
    }

    fn init_step(&mut self, step: SysStep, env: &mut TaskEnv) -> Result<StepOutcome> {
        let wait = self.config.child_wait;
        match step {
            SysStep::HandleResetReason => {
                env.log
                    .info(format_args!("🔌 Reset reason: {:?}", self.reset_reason));
                if self.reset_reason.needs_recovery() {
                    self.recovery_count = self.recovery_count.wrapping_add(1);
                    env.log.warn(format_args!(
                        "⚠️ Abnormal reset, recovery #{}",
                        self.recovery_count
                    ));
                    if let Err(e) = self.save_counters(env) {
                        env.log.warn(format_args!("⚠️ Recovery count not saved: {:#}", e));
                    }
                }
                self.link.publish(env.task.clone());
            }
            SysStep::PowerDownUnused
            | SysStep::PowerUpRequired
            | SysStep::StartNetworkInterface
            | SysStep::CreateEventLoop
            | SysStep::StartGpio => self.platform_step(step, env)?,
            SysStep::CreateI2c => {
                if let Some((config, factory)) = self.pending_i2c.take() {
                    let adapter = I2c::new(self.store.clone(), config, factory);
                    let scanner = adapter.scanner().with_log(env.log.clone());
                    self.i2c = Some(PeripheralObject::create(adapter, &self.caps)?);
                    lock(&self.handles).i2c_scanner = Some(scanner);
                }
            }
            SysStep::WaitI2c => {
                let (outcome, handle) = Self::wait_child(&self.i2c, wait, env);
                if handle.is_some() {
                    lock(&self.handles).i2c = handle;
                }
                return Ok(outcome);
            }
            SysStep::CreateSpi => {
                if let Some((config, factory)) = self.pending_spi.take() {
                    let adapter = Spi::new(self.store.clone(), config, factory);
                    self.spi = Some(PeripheralObject::create(adapter, &self.caps)?);
                }
            }
            SysStep::WaitSpi => {
                let (outcome, handle) = Self::wait_child(&self.spi, wait, env);
                if handle.is_some() {
                    lock(&self.handles).spi = handle;
                }
                return Ok(outcome);
            }
            SysStep::CreateDisplay => {
                if let Some(panel) = self.pending_panel.take() {
                    let adapter = Display::new(self.store.clone(), panel);
                    self.display = Some(PeripheralObject::create(adapter, &self.caps)?);
                }
            }
            SysStep::WaitDisplay => {
                let (outcome, handle) = Self::wait_child(&self.display, wait, env);
                if handle.is_some() {
                    lock(&self.handles).display = handle;
                }
                return Ok(outcome);
            }
            SysStep::CreateWifi => {
                if let Some((config, factory)) = self.pending_wifi.take() {
                    let adapter = Wifi::new(self.store.clone(), config, factory, &self.link);
                    self.wifi = Some(PeripheralObject::create(adapter, &self.caps)?);
                }
            }
            SysStep::WaitWifi => {
                let (outcome, handle) = Self::wait_child(&self.wifi, wait, env);
                if handle.is_some() {
                    lock(&self.handles).wifi = handle;
                }
                return Ok(outcome);
            }
            SysStep::StartSystemTimer => {
                self.timer = Some(SysTimer::start(
                    self.config,
                    Arc::clone(&self.flags),
                    env.log.clone(),
                )?);
            }
        }
        Ok(StepOutcome::Done)
    }

    fn on_init_finished(&mut self, env: &mut TaskEnv) {
        self.boot_count = self.boot_count.wrapping_add(1);
        self.flags
            .save_countdown
            .store(self.config.boot_save_delay_s.max(1), Ordering::Release);
        env.log
            .info(format_args!("🎉 System ready, boot #{}", self.boot_count));
    }

    fn on_notify(&mut self, code: SysNotify, env: &mut TaskEnv) {
        let state = match code {
            SysNotify::NfyWifiConnecting => WifiConnState::ConnectingSta,
            SysNotify::NfyWifiConnected => WifiConnState::ConnectedSta,
            SysNotify::NfyWifiDisconnecting => WifiConnState::DisconnectingSta,
            SysNotify::NfyWifiDisconnected => WifiConnState::Disconnected,
            SysNotify::CmdDestroyWifi => return self.destroy_wifi(env),
            SysNotify::CmdLogTaskInfo => {
                return log_task_info(&env.log, env.task_info.as_ref());
            }
            SysNotify::CmdShutDown => return,
        };
        // Late reports from a Wi-Fi object that is already gone
        if self.wifi.is_none() {
            env.log
                .debug(format_args!("Stale {:?} ignored", code));
            return;
        }
        self.set_wifi_state(state, env);
    }

    fn handle_request(&mut self, request: &Request<SysOpcode>, env: &mut TaskEnv) -> Response {
        let register = request.sub_address;
        match request.opcode {
            SysOpcode::GetWifiState => match Payload::from_slice(&[self.monitor.get() as u8]) {
                Ok(payload) => Response::data(register, payload),
                Err(_) => Response::error(register, status::INVALID_SIZE),
            },
            SysOpcode::GetBootCount => match Payload::from_slice(&self.boot_count.to_le_bytes()) {
                Ok(payload) => Response::data(register, payload),
                Err(_) => Response::error(register, status::INVALID_SIZE),
            },
            SysOpcode::SaveSettings => match self.save_counters(env) {
                Ok(()) => Response::ack(register),
                Err(e) => {
                    env.log.error(format_args!("❌ Save failed: {:#}", e));
                    Response::error(register, status::FAIL)
                }
            },
        }
    }

    fn housekeeping(&mut self, env: &mut TaskEnv) {
        if self.flags.save_requested.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.save_counters(env) {
                env.log.warn(format_args!("⚠️ Deferred save failed: {:#}", e));
            }
        }
        if self.flags.diagnostics_requested.swap(false, Ordering::AcqRel)
            && env.show.contains(ShowFlags::RUN)
        {
            env.log.info(format_args!(
                "📊 i2c={:?} spi={:?} display={:?} wifi={:?} link={:?}",
                self.i2c.as_ref().map(|c| c.status().mode()),
                self.spi.as_ref().map(|c| c.status().mode()),
                self.display.as_ref().map(|c| c.status().mode()),
                self.wifi.as_ref().map(|c| c.status().mode()),
                self.monitor.get()
            ));
            log_task_info(&env.log, env.task_info.as_ref());
        }
    }

    fn on_shutdown(&mut self, env: &mut TaskEnv) -> Result<()> {
        // Children stop reporting to a task that is about to exit
        self.link.withdraw();
        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }
        // A boot save still counting down is written now
        if self.flags.save_countdown.swap(0, Ordering::AcqRel) > 0
            || self.flags.save_requested.swap(false, Ordering::AcqRel)
        {
            self.save_counters(env)?;
        }
        Ok(())
    }

    fn release(&mut self, _log: &RouteLog) {
        self.destroy_children();
    }
}

// Also reached when the System task panicked
impl Drop for SystemCore {
    fn drop(&mut self) {
        self.destroy_children();
    }
}

/// Running System object plus the state it shares with its task.
pub struct System {
    object: PeripheralObject<SystemCore>,
    handles: Arc<Mutex<SystemHandles>>,
    monitor: Arc<ConnectionMonitor>,
    link: SystemLink,
}

impl System {
    /// Start the System task. Children come up asynchronously; use `wait_ready`.
    pub fn start(
        reset_reason: ResetReason,
        parts: SystemParts,
        config: SystemConfig,
        caps: &Capabilities,
    ) -> Result<Self> {
        let handles = Arc::new(Mutex::new(SystemHandles::default()));
        let monitor = Arc::new(ConnectionMonitor::new());
        let link = SystemLink::new();
        let core = SystemCore::new(
            reset_reason,
            parts,
            config,
            caps.clone(),
            link.clone(),
            Arc::clone(&handles),
            Arc::clone(&monitor),
        );
        let object = PeripheralObject::create(core, caps)?;
        Ok(Self {
            object,
            handles,
            monitor,
            link,
        })
    }

    pub fn wait_ready(&self, timeout: Duration) -> Option<PeripheralHandle<SysOpcode>> {
        self.object.wait_ready(timeout)
    }

    pub fn mode(&self) -> Mode {
        self.object.status().mode()
    }

    pub fn wifi_state(&self) -> WifiConnState {
        self.monitor.get()
    }

    pub fn monitor(&self) -> Arc<ConnectionMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn link(&self) -> &SystemLink {
        &self.link
    }

    pub fn i2c(&self) -> Option<PeripheralHandle<I2cOpcode>> {
        lock(&self.handles).i2c.clone()
    }

    pub fn i2c_scanner(&self) -> Option<I2cScanner> {
        lock(&self.handles).i2c_scanner.clone()
    }

    pub fn spi(&self) -> Option<PeripheralHandle<SpiOpcode>> {
        lock(&self.handles).spi.clone()
    }

    pub fn display(&self) -> Option<PeripheralHandle<DisplayOpcode>> {
        lock(&self.handles).display.clone()
    }

    pub fn wifi(&self) -> Option<PeripheralHandle<WifiOpcode>> {
        lock(&self.handles).wifi.clone()
    }

    /// Ask the System task to tear down the Wi-Fi object.
    pub fn destroy_wifi(&self) -> bool {
        match self.object.task_ref() {
            Some(task) => task.notify_with_retry(SysNotify::CmdDestroyWifi, 50, Duration::from_millis(10)),
            None => false,
        }
    }

    /// Stop the System task, then every child in reverse creation order.
    pub fn destroy(self) {
        self.object.destroy();
    }
}

/// Composition root: owns the one System instance.
pub struct Firmware {
    system: OnceLock<System>,
    boot: Mutex<()>,
}

impl Default for Firmware {
    fn default() -> Self {
        Self::new()
    }
}

impl Firmware {
    pub const fn new() -> Self {
        Self {
            system: OnceLock::new(),
            boot: Mutex::new(()),
        }
    }

    /// First call starts the System; later calls return it and drop their parts.
    pub fn boot(
        &self,
        reset_reason: ResetReason,
        parts: SystemParts,
        config: SystemConfig,
        caps: &Capabilities,
    ) -> Result<&System> {
        if let Some(system) = self.system.get() {
            return Ok(system);
        }
        let _boot = lock(&self.boot);
        if let Some(system) = self.system.get() {
            return Ok(system);
        }
        let system = System::start(reset_reason, parts, config, caps)?;
        Ok(self.system.get_or_init(|| system))
    }

    pub fn system(&self) -> Option<&System> {
        self.system.get()
    }

    /// Take the System out for teardown.
    pub fn shutdown(&mut self) -> Option<System> {
        self.system.take()
    }
}

#[cfg(target_os = "espidf")]
mod esp {
    use anyhow::Result;
    // Import ESP-IDF event loop for handling system events
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_sys::{esp, ESP_ERR_INVALID_STATE};
    use log::info;

    use super::Platform;

    /// Bring-up on the ESP32. Pin-level power control is board specific and only logged.
    pub struct EspPlatform {
        sys_loop: EspSystemEventLoop,
    }

    impl EspPlatform {
        pub fn new(sys_loop: EspSystemEventLoop) -> Self {
            Self { sys_loop }
        }

        pub fn event_loop(&self) -> EspSystemEventLoop {
            self.sys_loop.clone()
        }
    }

    // Already initialized by an earlier driver is fine
    fn tolerate_invalid_state(code: i32) -> Result<()> {
        if code == ESP_ERR_INVALID_STATE as i32 {
            return Ok(());
        }
        esp!(code)?;
        Ok(())
    }

    impl Platform for EspPlatform {
        fn power_down_unused(&mut self) -> Result<()> {
            info!("Powering down unused rails");
            Ok(())
        }

        fn power_up_required(&mut self) -> Result<()> {
            info!("Powering up required rails");
            Ok(())
        }

        fn start_network_interface(&mut self) -> Result<()> {
            // SAFETY: plain IDF init call, idempotent apart from INVALID_STATE
            tolerate_invalid_state(unsafe { esp_idf_sys::esp_netif_init() })
        }

        fn create_default_event_loop(&mut self) -> Result<()> {
            // Taken once in main and shared with the radio
            info!("Default event loop ready");
            Ok(())
        }

        fn start_gpio(&mut self) -> Result<()> {
            // SAFETY: installs the shared GPIO ISR service
            tolerate_invalid_state(unsafe { esp_idf_sys::gpio_install_isr_service(0) })
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspPlatform;
