// Logging and diagnostics capabilities handed to every peripheral at construction.
// Output from one subsystem is serialized through its route lock.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

// Import bitflags for the per-task verbosity categories
use bitflags::bitflags;

// Import the log facade; the backend (EspLogger or env_logger) is chosen by the binary
use log::Level;

bitflags! {
    /// Optional log categories a task prints in addition to errors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShowFlags: u8 {
        const INIT = 0x01;
        const NVS = 0x02;
        const RUN = 0x04;
        const EVENTS = 0x08;
        const SHUTDOWN = 0x10;
        const PAYLOAD = 0x80;
    }
}

impl Default for ShowFlags {
    fn default() -> Self {
        ShowFlags::INIT | ShowFlags::EVENTS | ShowFlags::SHUTDOWN
    }
}

/// Destination for log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, tag: &str, message: &str);
}

/// Forwards to the `log` facade with the subsystem tag as target.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn log(&self, level: Level, tag: &str, message: &str) {
        log::log!(target: tag, level, "{}", message);
    }
}

/// Tagged logger with its own route lock.
#[derive(Clone)]
pub struct RouteLog {
    tag: &'static str,
    sink: Arc<dyn LogSink>,
    route: Arc<Mutex<()>>,
}

impl fmt::Debug for RouteLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteLog").field("tag", &self.tag).finish()
    }
}

impl RouteLog {
    pub fn new(tag: &'static str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            tag,
            sink,
            route: Arc::new(Mutex::new(())),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn log(&self, level: Level, message: impl fmt::Display) {
        let message = message.to_string();
        let _route = self.route.lock().unwrap_or_else(PoisonError::into_inner);
        self.sink.log(level, self.tag, &message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::Error, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::Warn, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::Info, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::Debug, message);
    }
}

/// Stack and heap figures for the calling task.
pub trait TaskInfo: Send + Sync {
    /// Minimum free stack seen by the calling task, in bytes.
    fn stack_high_water_mark(&self) -> Option<u32>;
    fn free_heap(&self) -> Option<u32>;
}

/// Host threads expose neither figure.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdTaskInfo;

impl TaskInfo for StdTaskInfo {
    fn stack_high_water_mark(&self) -> Option<u32> {
        None
    }

    fn free_heap(&self) -> Option<u32> {
        None
    }
}

#[cfg(target_os = "espidf")]
#[derive(Debug, Default, Clone, Copy)]
pub struct EspTaskInfo;

#[cfg(target_os = "espidf")]
impl TaskInfo for EspTaskInfo {
    fn stack_high_water_mark(&self) -> Option<u32> {
        // A null handle queries the calling task
        let words = unsafe { esp_idf_sys::uxTaskGetStackHighWaterMark(std::ptr::null_mut()) };
        Some(words as u32)
    }

    fn free_heap(&self) -> Option<u32> {
        Some(unsafe { esp_idf_sys::esp_get_free_heap_size() })
    }
}

/// Task info for the current build target.
pub fn platform_task_info() -> Arc<dyn TaskInfo> {
    #[cfg(target_os = "espidf")]
    {
        Arc::new(EspTaskInfo)
    }
    #[cfg(not(target_os = "espidf"))]
    {
        Arc::new(StdTaskInfo)
    }
}

/// Log name, stack high-water mark and free heap of the calling task.
pub fn log_task_info(log: &RouteLog, info: &dyn TaskInfo) {
    let current = std::thread::current();
    let name = current.name().unwrap_or("unnamed");
    let fmt_opt = |v: Option<u32>| v.map_or_else(|| "n/a".to_string(), |v| v.to_string());
    log.info(format_args!(
        "📊 task={} stack_hwm={} free_heap={}",
        name,
        fmt_opt(info.stack_high_water_mark()),
        fmt_opt(info.free_heap())
    ));
}
