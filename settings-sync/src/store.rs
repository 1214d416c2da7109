//! Local settings store.
//!
//! Settings are a JSON object persisted to a single file. Names address
//! nested values with dots (`upgrade.autoDownloadUpdate`), so writing
//! `upgrade` replaces the whole section. Every write notifies subscribers
//! with the name that changed.

use crate::utils::errors::{Result, SyncError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

/// Full settings snapshot
pub type SettingsMap = Map<String, Value>;

/// Called with the name of a setting that changed
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Key/value access to the application settings
pub trait ConfigStore: Send + Sync {
    /// Snapshot of every setting
    fn get_all(&self) -> Result<SettingsMap>;

    /// Value at a dotted name, if present
    fn get(&self, name: &str) -> Option<Value>;

    /// Write one setting
    fn set(&self, name: &str, value: Value) -> Result<()>;

    /// Register for change notifications until the returned guard is dropped
    fn subscribe(&self, listener: ChangeListener) -> Subscription;
}

/// True when a change to `changed` may have altered the value at `watched`
pub fn affects(changed: &str, watched: &str) -> bool {
    changed == watched
        || watched
            .strip_prefix(changed)
            .is_some_and(|rest| rest.starts_with('.'))
        || changed
            .strip_prefix(watched)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: HashMap<u64, ChangeListener>,
}

/// Registry of change listeners
#[derive(Clone, Default)]
pub struct Listeners {
    table: Arc<Mutex<ListenerTable>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: ChangeListener) -> Subscription {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let id = table.next_id;
        table.next_id += 1;
        table.entries.insert(id, listener);
        debug!("Registered settings listener {}", id);

        Subscription {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Invoke every listener; the table is not locked while they run
    pub fn notify(&self, name: &str) {
        let listeners: Vec<ChangeListener> = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entries.values().cloned().collect()
        };
        for listener in listeners {
            listener(name);
        }
    }

    pub fn len(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer for a listener registration; unregisters exactly once on drop
#[must_use = "dropping the subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
}

impl Subscription {
    /// Unregister now instead of at end of scope
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            if table.entries.remove(&self.id).is_some() {
                debug!("Unregistered settings listener {}", self.id);
            }
        }
    }
}

/// Settings persisted as a JSON file
pub struct FileConfigStore {
    path: Option<PathBuf>,
    values: RwLock<SettingsMap>,
    listeners: Listeners,
}

impl FileConfigStore {
    /// Open the settings file; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = read_settings(&path)?;
        info!("Loaded {} settings from {}", values.len(), path.display());

        Ok(Self {
            path: Some(path),
            values: RwLock::new(values),
            listeners: Listeners::new(),
        })
    }

    /// Store that is never written to disk
    pub fn in_memory(values: SettingsMap) -> Self {
        Self {
            path: None,
            values: RwLock::new(values),
            listeners: Listeners::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of live subscriptions
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Re-read the file after an outside edit and notify the top-level
    /// settings whose values changed.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = read_settings(path)?;

        let changed: Vec<String> = {
            let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
            let mut changed: Vec<String> = fresh
                .iter()
                .filter(|(key, value)| values.get(*key) != Some(*value))
                .map(|(key, _)| key.clone())
                .collect();
            changed.extend(values.keys().filter(|key| !fresh.contains_key(*key)).cloned());
            *values = fresh;
            changed
        };

        for name in &changed {
            self.listeners.notify(name);
        }
        Ok(())
    }

    fn persist(&self, values: &SettingsMap) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(values)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn get_all(&self) -> Result<SettingsMap> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.clone())
    }

    fn get(&self, name: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut segments = name.split('.');
        let mut current = values.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current.clone())
    }

    fn set(&self, name: &str, value: Value) -> Result<()> {
        if name.split('.').any(str::is_empty) {
            return Err(SyncError::Config(format!("invalid setting name {:?}", name)));
        }

        {
            let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
            let previous = values.clone();
            insert_path(&mut values, name, value);
            if let Err(e) = self.persist(&values) {
                warn!("Failed to persist setting {}: {}", name, e);
                *values = previous;
                return Err(e);
            }
        }

        debug!("Setting changed: {}", name);
        self.listeners.notify(name);
        Ok(())
    }

    fn subscribe(&self, listener: ChangeListener) -> Subscription {
        self.listeners.add(listener)
    }
}

fn read_settings(path: &Path) -> Result<SettingsMap> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SettingsMap::new()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(SettingsMap::new());
    }

    match serde_json::from_str::<Value>(&content)? {
        Value::Object(values) => Ok(values),
        other => Err(SyncError::Config(format!(
            "settings file {} must hold a JSON object, found {}",
            path.display(),
            json_kind(&other)
        ))),
    }
}

/// Insert at a dotted path, replacing non-object intermediates
fn insert_path(values: &mut SettingsMap, name: &str, value: Value) {
    match name.split_once('.') {
        None => {
            values.insert(name.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = values
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(SettingsMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(SettingsMap::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn sample() -> SettingsMap {
        match json!({"theme": "dark", "upgrade": {"autoDownloadUpdate": false}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_get_walks_dotted_names() {
        let store = FileConfigStore::in_memory(sample());
        assert_eq!(store.get("theme"), Some(json!("dark")));
        assert_eq!(store.get("upgrade.autoDownloadUpdate"), Some(json!(false)));
        assert_eq!(store.get("upgrade.missing"), None);
        assert_eq!(store.get("theme.nested"), None);
    }

    #[test]
    fn test_set_nested_creates_sections() {
        let store = FileConfigStore::in_memory(SettingsMap::new());
        store.set("window.size.width", json!(800)).unwrap();
        assert_eq!(store.get("window.size.width"), Some(json!(800)));
        assert!(store.set("bad..name", json!(1)).is_err());
    }

    #[test]
    fn test_open_missing_file_is_empty_and_set_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileConfigStore::open(&path).unwrap();
        assert!(store.get_all().unwrap().is_empty());
        store.set("theme", json!("light")).unwrap();

        let reopened = FileConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get("theme"), Some(json!("light")));
    }

    #[test]
    fn test_open_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        assert!(matches!(FileConfigStore::open(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_subscription_fires_until_dropped() {
        let store = FileConfigStore::in_memory(sample());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let subscription = store.subscribe(Arc::new(move |name| {
            if name == "theme" {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));
        store.set("theme", json!("light")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.listeners.len(), 1);

        subscription.unsubscribe();
        assert!(store.listeners.is_empty());
        store.set("theme", json!("dark")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_notifies_changed_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"theme":"dark","lang":"en"}"#).unwrap();
        let store = FileConfigStore::open(&path).unwrap();

        let changed = Arc::new(Mutex::new(Vec::new()));
        let changed_clone = Arc::clone(&changed);
        let _subscription = store.subscribe(Arc::new(move |name| {
            changed_clone.lock().unwrap().push(name.to_string());
        }));

        std::fs::write(&path, r#"{"theme":"dark","lang":"fr"}"#).unwrap();
        store.reload().unwrap();

        assert_eq!(*changed.lock().unwrap(), vec!["lang".to_string()]);
        assert_eq!(store.get("lang"), Some(json!("fr")));
    }

    #[test]
    fn test_affects() {
        assert!(affects("upgrade.autoDownloadUpdate", "upgrade.autoDownloadUpdate"));
        assert!(affects("upgrade", "upgrade.autoDownloadUpdate"));
        assert!(!affects("upgrades", "upgrade.autoDownloadUpdate"));
        assert!(!affects("theme", "upgrade.autoDownloadUpdate"));
    }
}
