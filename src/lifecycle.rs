// Owning object lifecycle
// Creates the guard, mailbox and task for one peripheral, and tears them down in
// reverse order once the task has confirmed its own exit.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

// Import anyhow for setup failures
use anyhow::{anyhow, Result};

use crate::entry_guard::EntryGuard;
use crate::mailbox::Mailbox;
use crate::notification::{NotifyCode, Notifier};
use crate::protocol::{Opcode, Request, Response, ResponseChannel};
use crate::route_log::{platform_task_info, FacadeSink, LogSink, RouteLog, ShowFlags, TaskInfo};
use crate::state_machine::{
    Cadence, CadenceProfile, Machine, Mode, Peripheral, TaskEnv, TaskStatus,
};

// Host threads need more room than the FreeRTOS defaults for formatting and unwinding
#[cfg(not(target_os = "espidf"))]
const MIN_STACK_BYTES: usize = 64 * 1024;
#[cfg(target_os = "espidf")]
const MIN_STACK_BYTES: usize = 4 * 1024;

/// Reference used to notify a running task.
#[derive(Clone)]
pub struct TaskRef {
    name: &'static str,
    notifier: Arc<Notifier>,
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef").field("name", &self.name).finish()
    }
}

impl TaskRef {
    pub fn new(name: &'static str, notifier: Arc<Notifier>) -> Self {
        Self { name, notifier }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Deliver `code` unless another value is still pending.
    pub fn notify<N: NotifyCode>(&self, code: N) -> bool {
        self.notifier.notify(code.code())
    }

    /// Retry `notify` up to `attempts` times, sleeping `backoff` between tries.
    pub fn notify_with_retry<N: NotifyCode>(
        &self,
        code: N,
        attempts: u32,
        backoff: Duration,
    ) -> bool {
        for attempt in 0..attempts {
            if self.notify(code) {
                return true;
            }
            if attempt + 1 < attempts {
                thread::sleep(backoff);
            }
        }
        false
    }

    pub fn same_task(&self, other: &TaskRef) -> bool {
        Arc::ptr_eq(&self.notifier, &other.notifier)
    }
}

/// Task handle cell. The task clears it just before it terminates.
#[derive(Clone, Default)]
pub struct TaskSlot {
    inner: Arc<Mutex<Option<TaskRef>>>,
}

impl TaskSlot {
    fn lock(&self) -> MutexGuard<'_, Option<TaskRef>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, task: TaskRef) {
        *self.lock() = Some(task);
    }

    fn clear(&self) {
        *self.lock() = None;
    }

    pub fn get(&self) -> Option<TaskRef> {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }
}

// Clears the slot when the task closure ends, including by panic
struct ClearOnExit(TaskSlot);

impl Drop for ClearOnExit {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Handles a client copies out while holding the entry guard.
pub struct PeripheralHandle<Op> {
    task: TaskRef,
    mailbox: Mailbox<Request<Op>>,
    guard: EntryGuard,
    status: Arc<TaskStatus>,
}

impl<Op> Clone for PeripheralHandle<Op> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            mailbox: self.mailbox.clone(),
            guard: self.guard.clone(),
            status: Arc::clone(&self.status),
        }
    }
}

impl<Op> fmt::Debug for PeripheralHandle<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralHandle")
            .field("task", &self.task)
            .field("mode", &self.status.mode())
            .finish()
    }
}

impl<Op: Opcode> PeripheralHandle<Op> {
    pub fn get_task_handle(&self) -> &TaskRef {
        &self.task
    }

    pub fn get_mailbox_handle(&self) -> &Mailbox<Request<Op>> {
        &self.mailbox
    }

    pub fn entry_guard(&self) -> &EntryGuard {
        &self.guard
    }

    pub fn state(&self) -> Mode {
        self.status.mode()
    }

    /// Post `request` with its reply set to `reply` and wait for the response.
    ///
    /// `None` means the mailbox stayed busy or no response arrived in time; the
    /// framework does not guarantee delivery. Consume each response before the next call.
    pub fn transact(
        &self,
        request: Request<Op>,
        reply: &ResponseChannel,
        timeout: Duration,
    ) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        if !self
            .mailbox
            .send_timeout(request.reply_to(reply), timeout)
        {
            return None;
        }
        reply.receive(deadline.saturating_duration_since(Instant::now()))
    }
}

/// Tuning shared by every task created with the same capabilities.
#[derive(Debug, Clone, Copy)]
pub struct TaskProfile {
    pub cadence: CadenceProfile,
    /// Delay between notify/poll attempts while destroying.
    pub destroy_backoff: Duration,
    /// How long teardown waits for a client to give the entry guard back.
    pub guard_wait: Duration,
    pub show: ShowFlags,
}

impl Default for TaskProfile {
    fn default() -> Self {
        Self {
            cadence: CadenceProfile::default(),
            destroy_backoff: Duration::from_millis(50),
            guard_wait: Duration::from_secs(2),
            show: ShowFlags::default(),
        }
    }
}

impl TaskProfile {
    /// Millisecond cadences for simulations and tests.
    pub fn fast() -> Self {
        Self {
            cadence: CadenceProfile {
                idle: Duration::from_millis(5),
                active: Duration::from_millis(1),
                parked: Duration::from_millis(20),
            },
            destroy_backoff: Duration::from_millis(1),
            guard_wait: Duration::from_millis(100),
            show: ShowFlags::default(),
        }
    }
}

/// Logging and diagnostics capabilities injected into every peripheral.
#[derive(Clone)]
pub struct Capabilities {
    pub sink: Arc<dyn LogSink>,
    pub task_info: Arc<dyn TaskInfo>,
    pub profile: TaskProfile,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sink: Arc::new(FacadeSink),
            task_info: platform_task_info(),
            profile: TaskProfile::default(),
        }
    }
}

impl Capabilities {
    pub fn with_profile(mut self, profile: TaskProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// Owns one peripheral's guard, mailbox and task.
pub struct PeripheralObject<P: Peripheral> {
    log: RouteLog,
    guard: EntryGuard,
    mailbox: Mailbox<Request<P::Opcode>>,
    notifier: Arc<Notifier>,
    task: TaskSlot,
    status: Arc<TaskStatus>,
    parked: Arc<Mutex<Option<P>>>,
    backoff: Duration,
    guard_wait: Duration,
    entry_locked: AtomicBool,
    torn_down: bool,
}

impl<P: Peripheral> PeripheralObject<P> {
    /// Start `adapter` on its own task. Returns as soon as the task is running;
    /// callers must wait on the entry guard (see `wait_ready`) before using it.
    pub fn create(mut adapter: P, caps: &Capabilities) -> Result<Self> {
        let log = RouteLog::new(P::TAG, Arc::clone(&caps.sink));

        let guard = EntryGuard::new();
        let mailbox = Mailbox::new();
        let notifier = Arc::new(Notifier::new());

        adapter.restore_settings(&log);
        let stack_bytes = (adapter.run_stack_size_k() as usize * 1024).max(MIN_STACK_BYTES);

        // Held until Init/Finished
        guard.take(None);

        let task_ref = TaskRef::new(P::TASK_NAME, Arc::clone(&notifier));
        let slot = TaskSlot::default();
        slot.set(task_ref.clone());

        let status = Arc::new(TaskStatus::default());
        let parked = Arc::new(Mutex::new(None));
        let env = TaskEnv {
            log: log.clone(),
            task_info: Arc::clone(&caps.task_info),
            show: caps.profile.show,
            cadence: Cadence::new(caps.profile.cadence),
            task: task_ref,
        };
        let machine = Machine::new(
            adapter,
            env,
            Arc::clone(&notifier),
            mailbox.clone(),
            guard.clone(),
            Arc::clone(&status),
        );

        let spawned = {
            let slot = slot.clone();
            let parked = Arc::clone(&parked);
            thread::Builder::new()
                .name(P::TASK_NAME.to_string())
                .stack_size(stack_bytes)
                .spawn(move || {
                    let _clear = ClearOnExit(slot);
                    let adapter = machine.run();
                    *parked.lock().unwrap_or_else(PoisonError::into_inner) = Some(adapter);
                })
        };
        if let Err(e) = spawned {
            slot.clear();
            guard.give();
            mailbox.close();
            return Err(anyhow!("failed to start task {}: {}", P::TASK_NAME, e));
        }

        if caps.profile.show.contains(ShowFlags::INIT) {
            log.info(format_args!(
                "🧵 Task {} started ({} KB stack)",
                P::TASK_NAME,
                stack_bytes / 1024
            ));
        }

        Ok(Self {
            log,
            guard,
            mailbox,
            notifier,
            task: slot,
            status,
            parked,
            backoff: caps.profile.destroy_backoff,
            guard_wait: caps.profile.guard_wait,
            entry_locked: AtomicBool::new(false),
            torn_down: false,
        })
    }

    /// Wait up to `timeout` for the entry guard, copy out the handles, release it.
    pub fn wait_ready(&self, timeout: Duration) -> Option<PeripheralHandle<P::Opcode>> {
        if !self.guard.take(Some(timeout)) {
            return None;
        }
        let handle = self.task.get().map(|task| PeripheralHandle {
            task,
            mailbox: self.mailbox.clone(),
            guard: self.guard.clone(),
            status: Arc::clone(&self.status),
        });
        self.guard.give();
        handle
    }

    pub fn entry_guard(&self) -> &EntryGuard {
        &self.guard
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn task_ref(&self) -> Option<TaskRef> {
        self.task.get()
    }

    /// Take the entry guard ahead of teardown so no client can fetch handles any more.
    ///
    /// Waits up to `wait` for a client to give it back. While Init has not finished the
    /// initializer still holds it; `destroy` takes that hold over once the task is gone.
    pub fn lock_entry(&self, wait: Duration) -> bool {
        if self.entry_locked.load(Ordering::Acquire) {
            return true;
        }
        if self.status.init_finished_count() == 0 {
            return false;
        }
        let taken = self.guard.take(Some(wait));
        self.entry_locked.store(taken, Ordering::Release);
        taken
    }

    /// Tear down: blocks until the task has exited. A task stuck in a hardware call
    /// blocks this forever. The entry guard stays held afterwards.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        // 0. Lock the object with its entry guard
        if !self.lock_entry(self.guard_wait) && self.status.init_finished_count() > 0 {
            self.log.warn(format_args!(
                "⚠️ {} entry guard busy, destroying anyway",
                P::TASK_NAME
            ));
        }

        // 1. Keep asking until the shutdown notification is accepted
        while self.task.is_running() {
            if self.notifier.notify(P::Notify::SHUT_DOWN.code()) {
                break;
            }
            thread::sleep(self.backoff);
        }
        thread::yield_now();

        // 2. The task clears its own handle just before it terminates
        while self.task.is_running() {
            thread::sleep(self.backoff);
        }
        thread::yield_now();

        // 3. Guard passes from the initializer to this destroyer and is never given back
        self.guard.transfer_ownership();
        self.entry_locked.store(true, Ordering::Release);

        // 4. Release in reverse order of creation
        let adapter = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut adapter) = adapter {
            adapter.release(&self.log);
        }
        self.mailbox.close();

        self.log.info(format_args!("🧹 {} destroyed", P::TASK_NAME));
    }
}

impl<P: Peripheral> Drop for PeripheralObject<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}
