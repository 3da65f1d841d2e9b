// Settings persistence
// Each subsystem keeps a handful of values in its own namespace of the persistence store.
// The store lock doubles as the NVS entry guard: only one namespace session is open at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Context, Result};

// Import serde for JSON documents stored as strings
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::route_log::{RouteLog, ShowFlags};

// Key shared by every subsystem for its task stack override
pub const RUN_STACK_SIZE_KEY: &str = "runStackSizeK";

/// Key/value backend. One namespace is open at a time.
pub trait SettingsStore: Send {
    fn open(&mut self, namespace: &str) -> Result<()>;
    fn read_u32(&mut self, key: &str) -> Result<Option<u32>>;
    fn write_u32(&mut self, key: &str, value: u32) -> Result<()>;
    fn read_str(&mut self, key: &str) -> Result<Option<String>>;
    fn write_str(&mut self, key: &str, value: &str) -> Result<()>;
    fn close(&mut self);
}

/// Store shared between every task that persists settings.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Box<dyn SettingsStore>>>,
}

impl SharedStore {
    pub fn new(store: impl SettingsStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    /// Open `namespace`; the session holds the store until dropped.
    pub fn namespace(&self, namespace: &str) -> Result<Namespace<'_>> {
        let mut store = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        store
            .open(namespace)
            .with_context(|| format!("failed to open namespace '{}'", namespace))?;
        Ok(Namespace {
            store,
            name: namespace.to_string(),
        })
    }
}

/// Open namespace session. Closes the namespace on drop.
pub struct Namespace<'a> {
    store: MutexGuard<'a, Box<dyn SettingsStore>>,
    name: String,
}

impl Namespace<'_> {
    /// Read `key`, writing `default` back when it is missing.
    pub fn read_value(&mut self, key: &str, default: u32) -> Result<u32> {
        match self.store.read_u32(key)? {
            Some(value) => Ok(value),
            None => {
                self.store.write_u32(key, default)?;
                Ok(default)
            }
        }
    }

    pub fn write_value(&mut self, key: &str, value: u32) -> Result<()> {
        self.store
            .write_u32(key, value)
            .with_context(|| format!("failed to write {}/{}", self.name, key))
    }

    pub fn read_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.store.read_str(key)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| anyhow!("failed to parse {}/{}: {}", self.name, key, e)),
            None => Ok(None),
        }
    }

    pub fn write_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.store
            .write_str(key, &json)
            .with_context(|| format!("failed to write {}/{}", self.name, key))
    }
}

impl Drop for Namespace<'_> {
    fn drop(&mut self) {
        self.store.close();
    }
}

/// Restore a task stack size: a stored value larger than the default wins,
/// anything else is replaced by the default. Store failures fall back to the default.
pub fn restore_stack_size_k(
    store: &SharedStore,
    namespace: &str,
    default_k: u32,
    log: &RouteLog,
    show: ShowFlags,
) -> u32 {
    let restore = || -> Result<u32> {
        let mut ns = store.namespace(namespace)?;
        let stored = ns.read_value(RUN_STACK_SIZE_KEY, default_k)?;
        if stored < default_k {
            ns.write_value(RUN_STACK_SIZE_KEY, default_k)?;
            return Ok(default_k);
        }
        Ok(stored)
    };

    match restore() {
        Ok(stack_k) => {
            if show.contains(ShowFlags::NVS) {
                log.info(format_args!("💾 {}: runStackSizeK={}", namespace, stack_k));
            }
            stack_k
        }
        Err(e) => {
            log.warn(format_args!(
                "⚠️ Could not restore {} settings, using defaults: {:#}",
                namespace, e
            ));
            default_k
        }
    }
}

/// Persist a task stack size.
pub fn save_stack_size_k(store: &SharedStore, namespace: &str, stack_k: u32) -> Result<()> {
    store
        .namespace(namespace)?
        .write_value(RUN_STACK_SIZE_KEY, stack_k)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stored {
    U32(u32),
    Str(String),
}

type Namespaces = HashMap<String, HashMap<String, Stored>>;

/// In-memory store for the host build and tests. Clones share contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Namespaces>>,
    fail_writes: Arc<AtomicBool>,
    current: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write fail, to exercise fallback paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn get_u32(&self, namespace: &str, key: &str) -> Option<u32> {
        match self.lock().get(namespace)?.get(key)? {
            Stored::U32(value) => Some(*value),
            Stored::Str(_) => None,
        }
    }

    pub fn get_str(&self, namespace: &str, key: &str) -> Option<String> {
        match self.lock().get(namespace)?.get(key)? {
            Stored::Str(value) => Some(value.clone()),
            Stored::U32(_) => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Result<&str> {
        self.current
            .as_deref()
            .ok_or_else(|| anyhow!("no namespace open"))
    }

    fn write(&mut self, key: &str, value: Stored) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(anyhow!("write of '{}' rejected", key));
        }
        let namespace = self.current()?.to_string();
        self.lock()
            .entry(namespace)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Stored>> {
        let namespace = self.current()?;
        Ok(self
            .lock()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }
}

impl SettingsStore for MemoryStore {
    fn open(&mut self, namespace: &str) -> Result<()> {
        // Same 15 character limit as NVS
        if namespace.is_empty() || namespace.len() > 15 {
            return Err(anyhow!("invalid namespace '{}'", namespace));
        }
        self.current = Some(namespace.to_string());
        Ok(())
    }

    fn read_u32(&mut self, key: &str) -> Result<Option<u32>> {
        match self.read(key)? {
            Some(Stored::U32(value)) => Ok(Some(value)),
            Some(Stored::Str(_)) => Err(anyhow!("'{}' is not a u32", key)),
            None => Ok(None),
        }
    }

    fn write_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.write(key, Stored::U32(value))
    }

    fn read_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.read(key)? {
            Some(Stored::Str(value)) => Ok(Some(value)),
            Some(Stored::U32(_)) => Err(anyhow!("'{}' is not a string", key)),
            None => Ok(None),
        }
    }

    fn write_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.write(key, Stored::Str(value.to_string()))
    }

    fn close(&mut self) {
        self.current = None;
    }
}

// Import ESP-IDF's NVS (Non-Volatile Storage) functionality
#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

/// NVS-backed store on the default partition.
#[cfg(target_os = "espidf")]
pub struct EspNvsStore {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<NvsDefault>>,
}

#[cfg(target_os = "espidf")]
impl EspNvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
        }
    }

    fn nvs(&mut self) -> Result<&mut EspNvs<NvsDefault>> {
        self.nvs.as_mut().ok_or_else(|| anyhow!("no namespace open"))
    }
}

#[cfg(target_os = "espidf")]
impl SettingsStore for EspNvsStore {
    fn open(&mut self, namespace: &str) -> Result<()> {
        self.nvs = Some(EspNvs::new(self.partition.clone(), namespace, true)?);
        Ok(())
    }

    fn read_u32(&mut self, key: &str) -> Result<Option<u32>> {
        Ok(self.nvs()?.get_u32(key)?)
    }

    fn write_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.nvs()?.set_u32(key, value)?;
        Ok(())
    }

    fn read_str(&mut self, key: &str) -> Result<Option<String>> {
        let mut buffer = [0u8; 512];
        Ok(self.nvs()?.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn write_str(&mut self, key: &str, value: &str) -> Result<()> {
        self.nvs()?.set_str(key, value)?;
        Ok(())
    }

    fn close(&mut self) {
        self.nvs = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route_log::FacadeSink;

    fn log() -> RouteLog {
        RouteLog::new("test", Arc::new(FacadeSink))
    }

    #[test]
    fn read_value_writes_default_when_missing() {
        let mem = MemoryStore::new();
        let store = SharedStore::new(mem.clone());
        let value = store.namespace("display").unwrap().read_value("k", 7).unwrap();
        assert_eq!(value, 7);
        assert_eq!(mem.get_u32("display", "k"), Some(7));
    }

    #[test]
    fn stack_size_prefers_larger_stored_value() {
        let mem = MemoryStore::new();
        let store = SharedStore::new(mem.clone());
        save_stack_size_k(&store, "i2c", 24).unwrap();
        assert_eq!(restore_stack_size_k(&store, "i2c", 10, &log(), ShowFlags::empty()), 24);

        save_stack_size_k(&store, "spi", 4).unwrap();
        assert_eq!(restore_stack_size_k(&store, "spi", 10, &log(), ShowFlags::empty()), 10);
        assert_eq!(mem.get_u32("spi", RUN_STACK_SIZE_KEY), Some(10));
    }

    #[test]
    fn store_failure_falls_back_to_default() {
        let mem = MemoryStore::new();
        mem.set_fail_writes(true);
        let store = SharedStore::new(mem);
        assert_eq!(restore_stack_size_k(&store, "wifi", 12, &log(), ShowFlags::NVS), 12);
    }

    #[test]
    fn json_documents_round_trip_through_strings() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Doc {
            ssid: String,
        }
        let mem = MemoryStore::new();
        let store = SharedStore::new(mem.clone());
        store
            .namespace("wifi")
            .unwrap()
            .write_json("creds", &Doc { ssid: "lab".into() })
            .unwrap();
        assert_eq!(mem.get_str("wifi", "creds").as_deref(), Some(r#"{"ssid":"lab"}"#));
        let back: Option<Doc> = store.namespace("wifi").unwrap().read_json("creds").unwrap();
        assert_eq!(back, Some(Doc { ssid: "lab".into() }));
    }

    #[test]
    fn namespace_names_follow_nvs_limits() {
        let store = SharedStore::new(MemoryStore::new());
        assert!(store.namespace("a_namespace_too_long").is_err());
    }
}
