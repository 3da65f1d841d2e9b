// Peripheral state machine
// One dedicated task per peripheral drives Init sub-steps, then the Run loop
// (notification, then mailbox, then housekeeping), then Shutdown.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// Import anyhow for setup failures raised by init steps
use anyhow::Result;

use crate::entry_guard::EntryGuard;
use crate::lifecycle::TaskRef;
use crate::mailbox::Mailbox;
use crate::notification::{NotifyCode, Notifier};
use crate::protocol::{status, Opcode, Request, Response};
use crate::route_log::{log_task_info, RouteLog, ShowFlags, TaskInfo};

// How long a response post may wait on a busy client channel before it is dropped
pub const RESPONSE_SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Top-level operating mode of a peripheral task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Init = 0,
    Run = 1,
    Shutdown = 2,
    Error = 3,
    Idle = 4,
}

impl Mode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Mode::Init,
            1 => Mode::Run,
            2 => Mode::Shutdown,
            3 => Mode::Error,
            _ => Mode::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Start,
    /// Index into the adapter's init table.
    Step(usize),
    Finished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Start,
    Finished,
    Error,
}

/// What happens after an init step completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Fall through to the next step in the same scheduling slice.
    Immediate,
    /// Return to the loop; the next step runs on the following iteration.
    Yield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Not complete yet; retry the same step next iteration.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceProfile {
    pub idle: Duration,
    pub active: Duration,
    pub parked: Duration,
}

impl Default for CadenceProfile {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(250),
            active: Duration::from_millis(10),
            parked: Duration::from_secs(5),
        }
    }
}

/// Notification wait used as the loop's only yield point.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    profile: CadenceProfile,
    current: Duration,
}

impl Cadence {
    pub fn new(profile: CadenceProfile) -> Self {
        Self {
            profile,
            current: profile.idle,
        }
    }

    /// Short waits while stepping through Init/Shutdown.
    pub fn hurry(&mut self) {
        self.current = self.profile.active;
    }

    pub fn relax(&mut self) {
        self.current = self.profile.idle;
    }

    pub fn park(&mut self) {
        self.current = self.profile.parked;
    }

    pub fn wait(&self) -> Duration {
        self.current
    }
}

/// Observable state of one peripheral task.
#[derive(Debug, Default)]
pub struct TaskStatus {
    mode: AtomicU8,
    init_finished: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl TaskStatus {
    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Number of times Init/Finished has executed.
    pub fn init_finished_count(&self) -> u32 {
        self.init_finished.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

/// Everything an adapter may touch from inside its task.
pub struct TaskEnv {
    pub log: RouteLog,
    pub task_info: Arc<dyn TaskInfo>,
    pub show: ShowFlags,
    pub cadence: Cadence,
    /// Reference to the task running this adapter.
    pub task: TaskRef,
}

/// Subsystem-specific behaviour plugged into the generic driver loop.
pub trait Peripheral: Send + 'static {
    type Opcode: Opcode;
    type Notify: NotifyCode;
    type Step: Copy + Debug + Send + 'static;

    const TAG: &'static str;
    const TASK_NAME: &'static str;
    /// Init sub-steps between Start and Finished, in order.
    const INIT_STEPS: &'static [(Self::Step, Transition)];
    /// Deliver notifications to `on_notify` while still in Init instead of dropping them.
    const NOTIFY_DURING_INIT: bool = false;

    /// Load persisted configuration; failures keep defaults.
    fn restore_settings(&mut self, log: &RouteLog);

    fn run_stack_size_k(&self) -> u32;

    fn init_step(&mut self, step: Self::Step, env: &mut TaskEnv) -> Result<StepOutcome>;

    fn on_init_finished(&mut self, _env: &mut TaskEnv) {}

    /// Non-shutdown notification received in Run (or Init, see `NOTIFY_DURING_INIT`).
    fn on_notify(&mut self, _code: Self::Notify, _env: &mut TaskEnv) {}

    /// Execute one validated request. Bus failures become error responses.
    fn handle_request(&mut self, request: &Request<Self::Opcode>, env: &mut TaskEnv) -> Response;

    /// Periodic work, at most once per Run iteration.
    fn housekeeping(&mut self, _env: &mut TaskEnv) {}

    /// Stop accepting work. Resources are released by the owning object afterwards.
    fn on_shutdown(&mut self, _env: &mut TaskEnv) -> Result<()> {
        Ok(())
    }

    /// Free drivers and buses. Called by the owning object after the task has exited.
    fn release(&mut self, _log: &RouteLog) {}
}

/// The driver loop for one peripheral task.
pub struct Machine<P: Peripheral> {
    adapter: P,
    env: TaskEnv,
    notifier: Arc<Notifier>,
    mailbox: Mailbox<Request<P::Opcode>>,
    guard: EntryGuard,
    status: Arc<TaskStatus>,
    init: InitPhase,
    shutdown: ShutdownPhase,
    error_logged: bool,
    // Reused for every request; at most one request is in flight
    response: Response,
}

impl<P: Peripheral> Machine<P> {
    pub fn new(
        adapter: P,
        env: TaskEnv,
        notifier: Arc<Notifier>,
        mailbox: Mailbox<Request<P::Opcode>>,
        guard: EntryGuard,
        status: Arc<TaskStatus>,
    ) -> Self {
        status.set_mode(Mode::Init);
        Self {
            adapter,
            env,
            notifier,
            mailbox,
            guard,
            status,
            init: InitPhase::Start,
            shutdown: ShutdownPhase::Start,
            error_logged: false,
            response: Response::default(),
        }
    }

    /// Drive the task until Shutdown/Finished, then hand the adapter back to the owner.
    pub fn run(mut self) -> P {
        loop {
            let code = self.notifier.take_wait(self.env.cadence.wait());
            if code != 0 {
                self.dispatch_notification(code);
            } else if self.status.mode() == Mode::Run {
                self.serve_mailbox();
            }

            match self.status.mode() {
                Mode::Init => self.step_init(),
                Mode::Run => self.adapter.housekeeping(&mut self.env),
                Mode::Shutdown => {
                    if self.step_shutdown() {
                        break;
                    }
                }
                Mode::Error => self.enter_idle(),
                Mode::Idle => {}
            }
        }
        self.adapter
    }

    fn dispatch_notification(&mut self, code: u32) {
        let Some(notify) = P::Notify::from_code(code) else {
            self.env
                .log
                .warn(format_args!("⚠️ Unknown notification {}", code));
            return;
        };

        if notify == P::Notify::SHUT_DOWN {
            if self.status.mode() != Mode::Shutdown {
                if self.env.show.contains(ShowFlags::SHUTDOWN) {
                    self.env.log.info("🛑 Shutdown requested");
                }
                self.shutdown = ShutdownPhase::Start;
                self.status.set_mode(Mode::Shutdown);
            }
            return;
        }

        match self.status.mode() {
            Mode::Run => self.adapter.on_notify(notify, &mut self.env),
            Mode::Init if P::NOTIFY_DURING_INIT => self.adapter.on_notify(notify, &mut self.env),
            mode => self.env.log.debug(format_args!(
                "Notification {:?} ignored in {:?}",
                notify, mode
            )),
        }
    }

    fn serve_mailbox(&mut self) {
        let Some(request) = self.mailbox.peek(Duration::ZERO) else {
            return;
        };

        if request.debug || self.env.show.contains(ShowFlags::PAYLOAD) {
            self.env.log.info(format_args!(
                "📥 {:?} dev=0x{:02X} reg=0x{:02X} len={} {:?}",
                request.opcode,
                request.device,
                request.sub_address,
                request.payload.len(),
                request.payload
            ));
        }

        self.response = match request.validate() {
            Ok(()) => self.adapter.handle_request(&request, &mut self.env),
            Err(e) => {
                self.env.log.warn(format_args!(
                    "⚠️ Rejected {:?}: {}",
                    request.opcode, e
                ));
                Response::error(request.sub_address, status::INVALID_SIZE)
            }
        };

        if request.debug || self.env.show.contains(ShowFlags::PAYLOAD) {
            self.env.log.info(format_args!(
                "📤 {:?} reg=0x{:02X} {:?}",
                self.response.result, self.response.sub_address, self.response.payload
            ));
        }

        if let Some(reply) = &request.reply_to {
            if !reply.send_timeout(self.response.clone(), RESPONSE_SEND_TIMEOUT) {
                self.env
                    .log
                    .debug("Response dropped, client channel busy or closed");
            }
        }

        self.mailbox.remove();
    }

    fn step_init(&mut self) {
        loop {
            match self.init {
                InitPhase::Start => {
                    self.env.cadence.hurry();
                    if self.env.show.contains(ShowFlags::INIT) {
                        self.env.log.info("🚀 Init started");
                    }
                    self.init = self.next_init(None);
                }
                InitPhase::Step(index) => {
                    let (step, transition) = P::INIT_STEPS[index];
                    if self.env.show.contains(ShowFlags::INIT) {
                        self.env.log.debug(format_args!("Init step {:?}", step));
                    }
                    match self.adapter.init_step(step, &mut self.env) {
                        Ok(StepOutcome::Done) => {
                            self.init = self.next_init(Some(index));
                            if transition == Transition::Yield {
                                return;
                            }
                        }
                        Ok(StepOutcome::Pending) => return,
                        Err(e) => {
                            self.record_error(format!("init step {:?} failed: {:#}", step, e));
                            self.init = InitPhase::Error;
                        }
                    }
                }
                InitPhase::Finished => {
                    self.env.cadence.relax();
                    self.adapter.on_init_finished(&mut self.env);
                    self.status.init_finished.fetch_add(1, Ordering::AcqRel);
                    self.status.set_mode(Mode::Run);
                    if self.env.show.contains(ShowFlags::INIT) {
                        self.env.log.info("✅ Init finished");
                    }
                    // Ready: clients may now fetch handles
                    self.guard.give();
                    return;
                }
                InitPhase::Error => {
                    self.status.set_mode(Mode::Error);
                    return;
                }
            }
        }
    }

    fn next_init(&self, current: Option<usize>) -> InitPhase {
        let next = current.map_or(0, |i| i + 1);
        if next < P::INIT_STEPS.len() {
            InitPhase::Step(next)
        } else {
            InitPhase::Finished
        }
    }

    // Returns true once the loop should exit.
    fn step_shutdown(&mut self) -> bool {
        loop {
            match self.shutdown {
                ShutdownPhase::Start => {
                    self.env.cadence.hurry();
                    self.shutdown = match self.adapter.on_shutdown(&mut self.env) {
                        Ok(()) => ShutdownPhase::Finished,
                        Err(e) => {
                            self.record_error(format!("shutdown failed: {:#}", e));
                            ShutdownPhase::Error
                        }
                    };
                }
                ShutdownPhase::Finished => {
                    if self.env.show.contains(ShowFlags::SHUTDOWN) {
                        self.env.log.info("👋 Shutdown finished");
                    }
                    return true;
                }
                ShutdownPhase::Error => {
                    self.env.log.error("❌ Shutdown finished with errors");
                    return true;
                }
            }
        }
    }

    fn record_error(&mut self, message: String) {
        self.status.set_error(message);
        self.error_logged = false;
    }

    // Error logs once, then parks at the long cadence waiting for an explicit trigger.
    fn enter_idle(&mut self) {
        if !self.error_logged {
            let message = self
                .status
                .last_error()
                .unwrap_or_else(|| "unknown error".to_string());
            self.env.log.error(format_args!("❌ {}", message));
            log_task_info(&self.env.log, self.env.task_info.as_ref());
            self.error_logged = true;
        }
        self.env.cadence.park();
        self.status.set_mode(Mode::Idle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::*;
    use crate::route_log::{FacadeSink, StdTaskInfo};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Load,
        Open,
        Probe,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Echo,
    }

    impl Opcode for Op {
        fn requires_payload(self) -> bool {
            false
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Cmd {
        ShutDown = 1,
    }

    impl NotifyCode for Cmd {
        const SHUT_DOWN: Self = Cmd::ShutDown;

        fn code(self) -> u32 {
            self as u32
        }

        fn from_code(code: u32) -> Option<Self> {
            (code == 1).then_some(Cmd::ShutDown)
        }
    }

    #[derive(Default)]
    struct Recorder {
        steps: Arc<Mutex<Vec<Step>>>,
        pending_opens: u32,
        fail_probe: bool,
    }

    impl Peripheral for Recorder {
        type Opcode = Op;
        type Notify = Cmd;
        type Step = Step;

        const TAG: &'static str = "rec";
        const TASK_NAME: &'static str = "rec_run";
        const INIT_STEPS: &'static [(Step, Transition)] = &[
            (Step::Load, Transition::Immediate),
            (Step::Open, Transition::Yield),
            (Step::Probe, Transition::Immediate),
        ];

        fn restore_settings(&mut self, _log: &RouteLog) {}

        fn run_stack_size_k(&self) -> u32 {
            4
        }

        fn init_step(&mut self, step: Step, _env: &mut TaskEnv) -> Result<StepOutcome> {
            self.steps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(step);
            match step {
                Step::Open if self.pending_opens > 0 => {
                    self.pending_opens -= 1;
                    Ok(StepOutcome::Pending)
                }
                Step::Probe if self.fail_probe => Err(anyhow!("nothing answered")),
                _ => Ok(StepOutcome::Done),
            }
        }

        fn handle_request(&mut self, request: &Request<Op>, _env: &mut TaskEnv) -> Response {
            Response::ack(request.sub_address)
        }
    }

    fn machine(adapter: Recorder) -> (Machine<Recorder>, EntryGuard, Arc<TaskStatus>) {
        let notifier = Arc::new(Notifier::new());
        let env = TaskEnv {
            log: RouteLog::new("rec", Arc::new(FacadeSink)),
            task_info: Arc::new(StdTaskInfo),
            show: ShowFlags::empty(),
            cadence: Cadence::new(CadenceProfile::default()),
            task: TaskRef::new("rec_run", Arc::clone(&notifier)),
        };
        let guard = EntryGuard::new();
        guard.take(None);
        let status = Arc::new(TaskStatus::default());
        let m = Machine::new(
            adapter,
            env,
            notifier,
            Mailbox::new(),
            guard.clone(),
            Arc::clone(&status),
        );
        (m, guard, status)
    }

    fn recorded(steps: &Arc<Mutex<Vec<Step>>>) -> Vec<Step> {
        steps.lock().unwrap().clone()
    }

    #[test]
    fn immediate_steps_fall_through_and_yield_steps_stop() {
        let adapter = Recorder::default();
        let steps = Arc::clone(&adapter.steps);
        let (mut m, guard, status) = machine(adapter);
        let profile = CadenceProfile::default();

        // Load falls through into Open, which yields
        m.step_init();
        assert_eq!(recorded(&steps), vec![Step::Load, Step::Open]);
        assert_eq!(m.init, InitPhase::Step(2));
        assert_eq!(m.env.cadence.wait(), profile.active);
        assert_eq!(status.mode(), Mode::Init);
        assert!(!guard.is_available());

        // Probe is the last step and falls through into Finished
        m.step_init();
        assert_eq!(recorded(&steps), vec![Step::Load, Step::Open, Step::Probe]);
        assert_eq!(status.mode(), Mode::Run);
        assert_eq!(status.init_finished_count(), 1);
        assert!(guard.is_available());
        assert_eq!(m.env.cadence.wait(), profile.idle);
    }

    #[test]
    fn pending_step_is_retried_next_slice() {
        let adapter = Recorder {
            pending_opens: 2,
            ..Recorder::default()
        };
        let steps = Arc::clone(&adapter.steps);
        let (mut m, _guard, status) = machine(adapter);

        m.step_init();
        m.step_init();
        assert_eq!(recorded(&steps), vec![Step::Load, Step::Open, Step::Open]);
        assert_eq!(status.mode(), Mode::Init);

        m.step_init();
        m.step_init();
        assert_eq!(status.mode(), Mode::Run);
        assert_eq!(
            recorded(&steps),
            vec![Step::Load, Step::Open, Step::Open, Step::Open, Step::Probe]
        );
    }

    #[test]
    fn failed_step_parks_with_long_cadence() {
        let adapter = Recorder {
            fail_probe: true,
            ..Recorder::default()
        };
        let (mut m, guard, status) = machine(adapter);

        m.step_init();
        m.step_init();
        assert_eq!(status.mode(), Mode::Error);
        assert!(status.last_error().unwrap().contains("nothing answered"));

        m.enter_idle();
        assert_eq!(status.mode(), Mode::Idle);
        assert_eq!(m.env.cadence.wait(), CadenceProfile::default().parked);
        assert_eq!(status.init_finished_count(), 0);
        assert!(!guard.is_available());
    }

    #[test]
    fn shutdown_hurries_then_returns_the_adapter() {
        let (mut m, _guard, status) = machine(Recorder::default());
        m.step_init();
        m.step_init();
        assert_eq!(status.mode(), Mode::Run);

        m.dispatch_notification(Cmd::ShutDown.code());
        assert_eq!(status.mode(), Mode::Shutdown);
        assert!(m.step_shutdown());
        assert_eq!(m.env.cadence.wait(), CadenceProfile::default().active);
    }
}
