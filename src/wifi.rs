// Wi-Fi station peripheral
// Owns the radio, keeps credentials in NVS, and reports connection changes to the System task.

use std::time::Duration;

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Result};

// Import Serde traits for JSON serialization
// This allows us to save Rust structs as JSON strings in NVS
use serde::{Deserialize, Serialize};

use crate::lifecycle::TaskRef;
use crate::notification::NotifyCode;
use crate::protocol::{status, Opcode, Payload, Request, Response};
use crate::route_log::{log_task_info, RouteLog, ShowFlags};
use crate::settings::{restore_stack_size_k, SharedStore};
use crate::state_machine::{Peripheral, StepOutcome, TaskEnv, Transition};
use crate::system::{SysNotify, SystemLink};

// NVS storage keys
const NVS_NAMESPACE: &str = "wifi";
const WIFI_CONFIG_KEY: &str = "wifi_creds"; // Complete credentials as JSON
const AUTO_CONNECT_KEY: &str = "autoConnect";
const DEFAULT_STACK_K: u32 = 12;
const SYSTEM_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Station credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(anyhow!("SSID must be 1-32 bytes"));
        }
        if self.password.len() > 64 {
            return Err(anyhow!("password must be at most 64 bytes"));
        }
        Ok(())
    }
}

// Stored form, with a validity flag so credentials can be invalidated without erasing
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredWifiConfig {
    ssid: String,
    password: String,
    is_valid: bool,
}

pub fn store_credentials(store: &SharedStore, credentials: &WifiCredentials) -> Result<()> {
    credentials.validate()?;
    let stored = StoredWifiConfig {
        ssid: credentials.ssid.clone(),
        password: credentials.password.clone(),
        is_valid: true,
    };
    store
        .namespace(NVS_NAMESPACE)?
        .write_json(WIFI_CONFIG_KEY, &stored)
}

pub fn load_credentials(store: &SharedStore) -> Result<Option<WifiCredentials>> {
    let stored: Option<StoredWifiConfig> = store.namespace(NVS_NAMESPACE)?.read_json(WIFI_CONFIG_KEY)?;
    Ok(stored
        .filter(|config| config.is_valid)
        .map(|config| WifiCredentials {
            ssid: config.ssid,
            password: config.password,
        }))
}

/// Radio driver collaborator.
pub trait WifiRadio: Send {
    fn start(&mut self) -> Result<()>;
    /// Blocks until associated and the network interface is up.
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn stop(&mut self) -> Result<()>;
}

pub type WifiRadioFactory = Box<dyn FnOnce() -> Result<Box<dyn WifiRadio>> + Send>;

/// Station connection state as seen by the System.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum WifiConnState {
    #[default]
    Disconnected = 0,
    ConnectingSta = 1,
    ConnectedSta = 2,
    DisconnectingSta = 3,
}

impl WifiConnState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WifiConnState::Disconnected),
            1 => Some(WifiConnState::ConnectingSta),
            2 => Some(WifiConnState::ConnectedSta),
            3 => Some(WifiConnState::DisconnectingSta),
            _ => None,
        }
    }

    fn notification(self) -> SysNotify {
        match self {
            WifiConnState::Disconnected => SysNotify::NfyWifiDisconnected,
            WifiConnState::ConnectingSta => SysNotify::NfyWifiConnecting,
            WifiConnState::ConnectedSta => SysNotify::NfyWifiConnected,
            WifiConnState::DisconnectingSta => SysNotify::NfyWifiDisconnecting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiConfig {
    pub auto_connect: bool,
    /// Attempts per state report to the System before giving up.
    pub report_attempts: u32,
    pub report_backoff: Duration,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            report_attempts: 10,
            report_backoff: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiOpcode {
    GetStatus,
    /// payload[0]: 0 disables auto-connect
    SetAutoConnect,
}

impl Opcode for WifiOpcode {
    fn requires_payload(self) -> bool {
        matches!(self, WifiOpcode::SetAutoConnect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WifiNotify {
    CmdConnect = 1,
    CmdDisconnect = 2,
    CmdLogTaskInfo = 3,
    CmdShutDown = 4,
}

impl NotifyCode for WifiNotify {
    const SHUT_DOWN: Self = WifiNotify::CmdShutDown;

    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(WifiNotify::CmdConnect),
            2 => Some(WifiNotify::CmdDisconnect),
            3 => Some(WifiNotify::CmdLogTaskInfo),
            4 => Some(WifiNotify::CmdShutDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStep {
    LoadCredentials,
    StartRadio,
}

pub struct Wifi {
    store: SharedStore,
    config: WifiConfig,
    factory: Option<WifiRadioFactory>,
    radio: Option<Box<dyn WifiRadio>>,
    credentials: Option<WifiCredentials>,
    system: Option<TaskRef>,
    link: SystemLink,
    state: WifiConnState,
    run_stack_size_k: u32,
}

impl Wifi {
    /// The System task reference is copied here, under the System link guard,
    /// before any of this object's own resources exist.
    pub fn new(
        store: SharedStore,
        config: WifiConfig,
        factory: WifiRadioFactory,
        link: &SystemLink,
    ) -> Self {
        Self {
            store,
            config,
            factory: Some(factory),
            radio: None,
            credentials: None,
            system: link.system_task(SYSTEM_LOOKUP_TIMEOUT),
            link: link.clone(),
            state: WifiConnState::Disconnected,
            run_stack_size_k: DEFAULT_STACK_K,
        }
    }

    // Bounded: the System may be the task currently destroying us
    fn report(&mut self, state: WifiConnState, env: &TaskEnv) {
        self.state = state;
        if env.show.contains(ShowFlags::EVENTS) {
            env.log.info(format_args!("📶 {:?}", state));
        }
        let Some(system) = &self.system else {
            return;
        };
        // Nobody drains the notification once the System task has withdrawn
        let listening = self
            .link
            .system_task(SYSTEM_LOOKUP_TIMEOUT)
            .is_some_and(|current| current.same_task(system));
        if !listening {
            env.log
                .debug(format_args!("System gone, {:?} not reported", state));
            return;
        }
        if !system.notify_with_retry(
            state.notification(),
            self.config.report_attempts,
            self.config.report_backoff,
        ) {
            env.log
                .warn(format_args!("⚠️ System did not take {:?} report", state));
        }
    }

    fn connect(&mut self, env: &TaskEnv) {
        if self.state == WifiConnState::ConnectedSta {
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            env.log.warn("⚠️ No stored credentials, staying disconnected");
            return;
        };
        if self.radio.is_none() {
            env.log.error("❌ Radio not started");
            return;
        }

        self.report(WifiConnState::ConnectingSta, env);
        let outcome = match self.radio.as_mut() {
            Some(radio) => radio.connect(&credentials),
            None => Err(anyhow!("radio not started")),
        };
        match outcome {
            Ok(()) => {
                env.log
                    .info(format_args!("✅ Connected to '{}'", credentials.ssid));
                self.report(WifiConnState::ConnectedSta, env);
            }
            Err(e) => {
                env.log.error(format_args!("❌ WiFi connection failed: {:#}", e));
                self.report(WifiConnState::Disconnected, env);
            }
        }
    }

    fn disconnect(&mut self, env: &TaskEnv) {
        if self.state == WifiConnState::Disconnected {
            return;
        }
        self.report(WifiConnState::DisconnectingSta, env);
        if let Some(radio) = self.radio.as_mut() {
            if let Err(e) = radio.disconnect() {
                env.log.warn(format_args!("⚠️ Disconnect failed: {:#}", e));
            }
        }
        self.report(WifiConnState::Disconnected, env);
    }
}

impl Peripheral for Wifi {
    type Opcode = WifiOpcode;
    type Notify = WifiNotify;
    type Step = WifiStep;

    const TAG: &'static str = "wifi";
    const TASK_NAME: &'static str = "wifi_run";
    const INIT_STEPS: &'static [(WifiStep, Transition)] = &[
        (WifiStep::LoadCredentials, Transition::Immediate),
        (WifiStep::StartRadio, Transition::Yield),
    ];

    fn restore_settings(&mut self, log: &RouteLog) {
        self.run_stack_size_k = restore_stack_size_k(
            &self.store,
            NVS_NAMESPACE,
            DEFAULT_STACK_K,
            log,
            ShowFlags::default(),
        );
        let default = self.config.auto_connect as u32;
        match self
            .store
            .namespace(NVS_NAMESPACE)
            .and_then(|mut ns| ns.read_value(AUTO_CONNECT_KEY, default))
        {
            Ok(value) => self.config.auto_connect = value != 0,
            Err(e) => log.warn(format_args!("⚠️ autoConnect not restored: {:#}", e)),
        }
    }

    fn run_stack_size_k(&self) -> u32 {
        self.run_stack_size_k
    }

    fn init_step(&mut self, step: WifiStep, env: &mut TaskEnv) -> Result<StepOutcome> {
        match step {
            WifiStep::LoadCredentials => match load_credentials(&self.store) {
                Ok(credentials) => {
                    if credentials.is_none() && env.show.contains(ShowFlags::INIT) {
                        env.log.info("No WiFi credentials stored");
                    }
                    self.credentials = credentials;
                }
                Err(e) => env
                    .log
                    .warn(format_args!("⚠️ Stored WiFi config unreadable: {:#}", e)),
            },
            WifiStep::StartRadio => {
                let factory = self
                    .factory
                    .take()
                    .ok_or_else(|| anyhow!("radio already started"))?;
                let mut radio = factory()?;
                radio.start()?;
                self.radio = Some(radio);
            }
        }
        Ok(StepOutcome::Done)
    }

    fn on_init_finished(&mut self, env: &mut TaskEnv) {
        if self.config.auto_connect && self.credentials.is_some() {
            // Connect from Run so readiness is not held up by association
            env.task.notify(WifiNotify::CmdConnect);
        }
    }

    fn on_notify(&mut self, code: WifiNotify, env: &mut TaskEnv) {
        match code {
            WifiNotify::CmdConnect => self.connect(env),
            WifiNotify::CmdDisconnect => self.disconnect(env),
            WifiNotify::CmdLogTaskInfo => log_task_info(&env.log, env.task_info.as_ref()),
            WifiNotify::CmdShutDown => {}
        }
    }

    fn handle_request(&mut self, request: &Request<WifiOpcode>, env: &mut TaskEnv) -> Response {
        let register = request.sub_address;
        match request.opcode {
            WifiOpcode::GetStatus => {
                let bytes = [self.state as u8, self.credentials.is_some() as u8];
                match Payload::from_slice(&bytes) {
                    Ok(payload) => Response::data(register, payload),
                    Err(_) => Response::error(register, status::INVALID_SIZE),
                }
            }
            WifiOpcode::SetAutoConnect => {
                let enabled = request.payload.as_slice()[0] != 0;
                let saved = self
                    .store
                    .namespace(NVS_NAMESPACE)
                    .and_then(|mut ns| ns.write_value(AUTO_CONNECT_KEY, enabled as u32));
                match saved {
                    Ok(()) => {
                        self.config.auto_connect = enabled;
                        Response::ack(register)
                    }
                    Err(e) => {
                        env.log.error(format_args!("❌ {:#}", e));
                        Response::error(register, status::FAIL)
                    }
                }
            }
        }
    }

    fn housekeeping(&mut self, env: &mut TaskEnv) {
        let link_lost = self.state == WifiConnState::ConnectedSta
            && self.radio.as_ref().is_some_and(|radio| !radio.is_connected());
        if link_lost {
            env.log.warn("⚠️ WiFi link lost");
            self.report(WifiConnState::Disconnected, env);
        }
    }

    fn on_shutdown(&mut self, env: &mut TaskEnv) -> Result<()> {
        self.disconnect(env);
        Ok(())
    }

    fn release(&mut self, log: &RouteLog) {
        if let Some(mut radio) = self.radio.take() {
            if let Err(e) = radio.stop() {
                log.warn(format_args!("⚠️ Radio stop failed: {:#}", e));
            }
        }
    }
}

#[cfg(target_os = "espidf")]
mod esp {
    // Import ESP-IDF event loop for handling system events
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::modem::Modem;
    use esp_idf_svc::hal::peripheral::Peripheral;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    // Import WiFi driver types from ESP-IDF
    use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
    // Import WiFi configuration types
    use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};

    use anyhow::{anyhow, Result};
    use log::info;

    use super::{WifiCredentials, WifiRadio};

    /// Station radio on the ESP32 modem.
    pub struct EspWifiRadio {
        wifi: BlockingWifi<EspWifi<'static>>,
    }

    impl EspWifiRadio {
        pub fn new(
            modem: impl Peripheral<P = Modem> + 'static,
            sys_loop: EspSystemEventLoop,
            nvs: EspDefaultNvsPartition,
        ) -> Result<Self> {
            let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
            let wifi = BlockingWifi::wrap(wifi, sys_loop)?;
            Ok(Self { wifi })
        }
    }

    impl WifiRadio for EspWifiRadio {
        fn start(&mut self) -> Result<()> {
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
            self.wifi.start()?;
            info!("WiFi started");
            Ok(())
        }

        fn connect(&mut self, credentials: &WifiCredentials) -> Result<()> {
            let config = Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("Invalid SSID format"))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("Invalid password format"))?,
                auth_method: if credentials.password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ..Default::default()
            });
            self.wifi.set_configuration(&config)?;
            self.wifi.connect()?;
            self.wifi.wait_netif_up()?;
            let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
            info!("WiFi netif up, IP: {}", ip_info.ip);
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.wifi.disconnect()?;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.wifi.is_connected().unwrap_or(false)
        }

        fn stop(&mut self) -> Result<()> {
            self.wifi.stop()?;
            Ok(())
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspWifiRadio;
