// Display peripheral
// Drives panel power and brightness and keeps the brightness setting persisted.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::notification::NotifyCode;
use crate::protocol::{status, BusError, Opcode, Payload, Request, Response};
use crate::route_log::{log_task_info, RouteLog, ShowFlags};
use crate::settings::{restore_stack_size_k, SharedStore};
use crate::state_machine::{Peripheral, StepOutcome, TaskEnv, Transition};

const NVS_NAMESPACE: &str = "display";
const SETTINGS_KEY: &str = "panel";
const DEFAULT_STACK_K: u32 = 10;

/// Panel driver collaborator.
pub trait Panel: Send {
    fn init(&mut self) -> Result<()>;
    fn set_power(&mut self, on: bool) -> Result<(), BusError>;
    fn set_brightness(&mut self, level: u8) -> Result<(), BusError>;
}

/// Panel that only logs, for boards without a display attached.
#[derive(Debug, Default)]
pub struct LogPanel;

impl Panel for LogPanel {
    fn init(&mut self) -> Result<()> {
        log::info!(target: "display", "🖥️ Log panel ready");
        Ok(())
    }

    fn set_power(&mut self, on: bool) -> Result<(), BusError> {
        log::info!(target: "display", "🖥️ Panel power {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn set_brightness(&mut self, level: u8) -> Result<(), BusError> {
        log::info!(target: "display", "🖥️ Panel brightness {}", level);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub brightness: u8,
    pub power_on: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            brightness: 128,
            power_on: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOpcode {
    /// payload[0]: 0 off, anything else on
    SetPower,
    /// payload[0]: brightness level
    SetBrightness,
    SaveSettings,
    GetSettings,
}

impl Opcode for DisplayOpcode {
    fn requires_payload(self) -> bool {
        matches!(self, DisplayOpcode::SetPower | DisplayOpcode::SetBrightness)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisplayNotify {
    NfyEmpty = 1,
    CmdEmpty = 2,
    CmdLogTaskInfo = 3,
    CmdShutDown = 4,
}

impl NotifyCode for DisplayNotify {
    const SHUT_DOWN: Self = DisplayNotify::CmdShutDown;

    fn code(self) -> u32 {
        self as u32
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(DisplayNotify::NfyEmpty),
            2 => Some(DisplayNotify::CmdEmpty),
            3 => Some(DisplayNotify::CmdLogTaskInfo),
            4 => Some(DisplayNotify::CmdShutDown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStep {
    InitPanel,
    ApplySettings,
}

pub struct Display {
    store: SharedStore,
    panel: Box<dyn Panel>,
    settings: DisplaySettings,
    dirty: bool,
    run_stack_size_k: u32,
}

impl Display {
    pub fn new(store: SharedStore, panel: Box<dyn Panel>) -> Self {
        Self {
            store,
            panel,
            settings: DisplaySettings::default(),
            dirty: false,
            run_stack_size_k: DEFAULT_STACK_K,
        }
    }

    fn save(&mut self, log: &RouteLog, show: ShowFlags) -> Result<()> {
        self.store
            .namespace(NVS_NAMESPACE)?
            .write_json(SETTINGS_KEY, &self.settings)?;
        self.dirty = false;
        if show.contains(ShowFlags::NVS) {
            log.info(format_args!("💾 Saved {:?}", self.settings));
        }
        Ok(())
    }
}

impl Peripheral for Display {
    type Opcode = DisplayOpcode;
    type Notify = DisplayNotify;
    type Step = DisplayStep;

    const TAG: &'static str = "display";
    const TASK_NAME: &'static str = "disp_run";
    const INIT_STEPS: &'static [(DisplayStep, Transition)] = &[
        (DisplayStep::InitPanel, Transition::Immediate),
        (DisplayStep::ApplySettings, Transition::Yield),
    ];

    fn restore_settings(&mut self, log: &RouteLog) {
        self.run_stack_size_k = restore_stack_size_k(
            &self.store,
            NVS_NAMESPACE,
            DEFAULT_STACK_K,
            log,
            ShowFlags::default(),
        );
        let stored = self
            .store
            .namespace(NVS_NAMESPACE)
            .and_then(|mut ns| ns.read_json::<DisplaySettings>(SETTINGS_KEY));
        match stored {
            Ok(Some(settings)) => self.settings = settings,
            Ok(None) => {}
            Err(e) => log.warn(format_args!("⚠️ Display settings not restored: {:#}", e)),
        }
    }

    fn run_stack_size_k(&self) -> u32 {
        self.run_stack_size_k
    }

    fn init_step(&mut self, step: DisplayStep, _env: &mut TaskEnv) -> Result<StepOutcome> {
        match step {
            DisplayStep::InitPanel => self.panel.init()?,
            DisplayStep::ApplySettings => {
                self.panel
                    .set_power(self.settings.power_on)
                    .and_then(|()| self.panel.set_brightness(self.settings.brightness))
                    .map_err(|e| anyhow!("panel rejected settings: {}", e))?;
            }
        }
        Ok(StepOutcome::Done)
    }

    fn on_notify(&mut self, code: DisplayNotify, env: &mut TaskEnv) {
        if env.show.contains(ShowFlags::RUN) {
            env.log.info(format_args!("Received {:?}", code));
        }
        if code == DisplayNotify::CmdLogTaskInfo {
            log_task_info(&env.log, env.task_info.as_ref());
        }
    }

    fn handle_request(&mut self, request: &Request<DisplayOpcode>, env: &mut TaskEnv) -> Response {
        let register = request.sub_address;
        let value = request.payload.as_slice().first().copied().unwrap_or(0);
        let result = match request.opcode {
            DisplayOpcode::SetPower => self.panel.set_power(value != 0).map(|()| {
                self.settings.power_on = value != 0;
                self.dirty = true;
            }),
            DisplayOpcode::SetBrightness => self.panel.set_brightness(value).map(|()| {
                self.settings.brightness = value;
                self.dirty = true;
            }),
            DisplayOpcode::SaveSettings => {
                return match self.save(&env.log, env.show) {
                    Ok(()) => Response::ack(register),
                    Err(e) => {
                        env.log.error(format_args!("❌ Save failed: {:#}", e));
                        Response::error(register, status::FAIL)
                    }
                };
            }
            DisplayOpcode::GetSettings => {
                let bytes = [self.settings.power_on as u8, self.settings.brightness];
                return match Payload::from_slice(&bytes) {
                    Ok(payload) => Response::data(register, payload),
                    Err(_) => Response::error(register, status::INVALID_SIZE),
                };
            }
        };
        match result {
            Ok(()) => Response::ack(register),
            Err(e) => Response::from_bus_error(register, &e),
        }
    }

    fn housekeeping(&mut self, env: &mut TaskEnv) {
        if !self.dirty {
            return;
        }
        if let Err(e) = self.save(&env.log, env.show) {
            // Retry next loop
            env.log.warn(format_args!("⚠️ Deferred save failed: {:#}", e));
        }
    }

    fn on_shutdown(&mut self, env: &mut TaskEnv) -> Result<()> {
        if self.dirty {
            self.save(&env.log, env.show)?;
        }
        self.panel
            .set_power(false)
            .map_err(|e| anyhow!("panel power off failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lifecycle::TaskRef;
    use crate::notification::Notifier;
    use crate::protocol::ResultCode;
    use crate::route_log::{FacadeSink, StdTaskInfo};
    use crate::settings::MemoryStore;
    use crate::sim::SimPanel;
    use crate::state_machine::{Cadence, CadenceProfile};

    fn env() -> TaskEnv {
        TaskEnv {
            log: RouteLog::new("display", Arc::new(FacadeSink)),
            task_info: Arc::new(StdTaskInfo),
            show: ShowFlags::empty(),
            cadence: Cadence::new(CadenceProfile::default()),
            task: TaskRef::new("disp_run", Arc::new(Notifier::new())),
        }
    }

    #[test]
    fn brightness_change_is_persisted_by_housekeeping() {
        let mem = MemoryStore::new();
        let panel = SimPanel::default();
        let mut display = Display::new(SharedStore::new(mem.clone()), Box::new(panel.clone()));
        let mut env = env();
        display.restore_settings(&env.log);
        for (step, _) in Display::INIT_STEPS {
            display.init_step(*step, &mut env).unwrap();
        }
        assert!(panel.state().initialized);

        let req = Request::new(DisplayOpcode::SetBrightness).payload(&[42]).unwrap();
        assert_eq!(display.handle_request(&req, &mut env).result, ResultCode::Ack);
        assert_eq!(panel.state().brightness, 42);
        assert!(mem.get_str("display", SETTINGS_KEY).is_none());

        display.housekeeping(&mut env);
        let saved: DisplaySettings =
            serde_json::from_str(&mem.get_str("display", SETTINGS_KEY).unwrap()).unwrap();
        assert_eq!(saved.brightness, 42);

        // A fresh instance restores what was saved
        let mut again = Display::new(SharedStore::new(mem), Box::new(SimPanel::default()));
        again.restore_settings(&env.log);
        let get = again.handle_request(&Request::new(DisplayOpcode::GetSettings), &mut env);
        assert_eq!(get.payload.as_slice(), &[1, 42]);
    }

    #[test]
    fn shutdown_powers_panel_off() {
        let panel = SimPanel::default();
        let mut display = Display::new(SharedStore::new(MemoryStore::new()), Box::new(panel.clone()));
        let mut env = env();
        let on = Request::new(DisplayOpcode::SetPower).payload(&[1]).unwrap();
        display.handle_request(&on, &mut env);
        assert!(panel.state().powered);
        display.on_shutdown(&mut env).unwrap();
        assert!(!panel.state().powered);
    }
}
