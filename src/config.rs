//! Configuration store
//!
//! A key/value store shared by every component of the flow. It holds the
//! loaded [`InstallerConfig`] (immutable) and the dynamic values written
//! while the user moves through the steps.
//!
//! The store is an explicitly constructed, cheaply cloneable handle. Change
//! notification is a publish/subscribe list owned by the store; every
//! subscription is represented by a [`Subscription`] guard which removes the
//! observer when dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use strum::{AsRefStr, Display, EnumString};

use crate::choices::{self, Choice};
use crate::config_file::InstallerConfig;
use crate::types::{PageRequest, Stage};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("{} mutex was poisoned, recovering", what);
        poisoned.into_inner()
    })
}

/// Keys of the dynamic values in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Key {
    // Modes
    DemoMode,
    TestMode,
    Version,

    // Flow state
    InstallationRunning,
    InternetConnection,
    DisplayedPage,
    SendNotification,
    ReadyStage,
    RunningStage,
    FinishedStage,

    // Choices made by the user
    Language,
    Locale,
    KeyboardLayout,
    Disk,
    DiskIsPartition,
    DiskEfiPartition,
    UseEncryption,
    EncryptionPin,
    DesktopChosen,
    UserName,
    UserUsername,
    UserAutologin,
    UserPassword,
    Formats,
    Timezone,
    SoftwareChoices,
    FeatureChoices,
}

/// A typed value in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    /// A machine value with its display name, e.g. `("us", "English (US)")`
    Pair(String, String),
    Choices(Vec<Choice>),
    Stage(Stage),
    Page(PageRequest),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn pair(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pair(code.into(), name.into())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_stage(&self) -> Option<Stage> {
        match self {
            Self::Stage(stage) => Some(*stage),
            _ => None,
        }
    }

    /// Representation handed to install scripts.
    ///
    /// Booleans become `1`/`0`, pairs their machine value, and choices the
    /// space-joined keywords of the selected entries.
    pub fn to_script_value(&self) -> String {
        match self {
            Self::Bool(true) => "1".to_string(),
            Self::Bool(false) => "0".to_string(),
            Self::Int(value) => value.to_string(),
            Self::Text(value) => value.clone(),
            Self::Pair(code, _) => code.clone(),
            Self::Choices(selection) => choices::keywords(selection),
            Self::Stage(stage) => stage.to_string(),
            Self::Page(request) => format!("{:?}", request),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pair(code, name) => write!(f, "{} ({})", name, code),
            other => write!(f, "{}", other.to_script_value()),
        }
    }
}

/// Identity of one observer in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Inner {
    settings: InstallerConfig,
    values: Mutex<HashMap<Key, Value>>,
    subscribers: Mutex<HashMap<Key, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = lock_or_recover(&self.subscribers, "subscriber");
        for list in subscribers.values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

/// Guard for a store subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    id: SubscriptionId,
    key: Key,
    store: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> Key {
        self.key
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}

/// Values used when nothing was ever set, e.g. in test mode where some pages
/// never write their value.
fn fallback_value(key: Key) -> Option<Value> {
    match key {
        Key::Language => Some(Value::pair("en_US", "English for Dummies")),
        Key::Locale => Some(Value::text("en_US.UTF-8")),
        Key::KeyboardLayout => Some(Value::pair("us", "English (US)")),
        Key::Disk => Some(Value::pair("/dev/null", "Test Dummy")),
        Key::DiskIsPartition => Some(Value::Bool(false)),
        Key::DiskEfiPartition => Some(Value::text("/dev/null")),
        _ => None,
    }
}

/// Values present from the start, not configurable through the file.
fn internal_values(settings: &InstallerConfig) -> HashMap<Key, Value> {
    HashMap::from([
        (Key::DemoMode, Value::Bool(settings.demo_mode)),
        (Key::TestMode, Value::Bool(settings.test_mode)),
        (Key::Version, Value::text(env!("CARGO_PKG_VERSION"))),
        (Key::InstallationRunning, Value::Bool(false)),
        (Key::InternetConnection, Value::Bool(false)),
        (Key::ReadyStage, Value::Stage(Stage::None)),
        (Key::RunningStage, Value::Stage(Stage::None)),
        (Key::FinishedStage, Value::Stage(Stage::None)),
        (Key::UseEncryption, Value::Bool(settings.disk_encryption.forced)),
        (Key::EncryptionPin, Value::text("")),
        (Key::DesktopChosen, Value::text("")),
        (Key::UserName, Value::text("")),
        (Key::UserUsername, Value::text("")),
        (Key::UserAutologin, Value::Bool(false)),
        (Key::UserPassword, Value::text("")),
        (Key::Formats, Value::pair("en_US.UTF-8", "United States")),
        (Key::Timezone, Value::text("UTC")),
        (Key::SoftwareChoices, Value::Choices(Vec::new())),
        (Key::FeatureChoices, Value::Choices(Vec::new())),
    ])
}

/// Shared configuration store handle.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("distribution", &self.inner.settings.distribution_name)
            .finish_non_exhaustive()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(InstallerConfig::default())
    }
}

impl ConfigStore {
    /// Create a store for the given installer configuration.
    pub fn new(settings: InstallerConfig) -> Self {
        let values = internal_values(&settings);
        Self {
            inner: Arc::new(Inner {
                settings,
                values: Mutex::new(values),
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The installer configuration this store was created from.
    pub fn settings(&self) -> &InstallerConfig {
        &self.inner.settings
    }

    fn values(&self) -> MutexGuard<'_, HashMap<Key, Value>> {
        lock_or_recover(&self.inner.values, "config value")
    }

    /// Returns true if a value was set (fallbacks do not count).
    pub fn has(&self, key: Key) -> bool {
        self.values().contains_key(&key)
    }

    /// Current value, or the fallback for keys that have one.
    pub fn get(&self, key: Key) -> Option<Value> {
        if let Some(value) = self.values().get(&key) {
            return Some(value.clone());
        }
        let fallback = fallback_value(key);
        if fallback.is_none() {
            log::debug!("Requested \"{}\" not in config", key);
        }
        fallback
    }

    /// Boolean value, `false` if unset or of another type.
    pub fn get_bool(&self, key: Key) -> bool {
        self.get(key).and_then(|value| value.as_bool()).unwrap_or(false)
    }

    /// Script representation of a value, empty if unset.
    pub fn get_text(&self, key: Key) -> String {
        self.get(key)
            .map(|value| value.to_script_value())
            .unwrap_or_default()
    }

    /// Set a value. Returns whether the store changed.
    ///
    /// Subscribers are called on the calling thread after the store lock is
    /// released.
    pub fn set(&self, key: Key, value: Value) -> bool {
        let callbacks = {
            let mut values = self.values();
            if values.get(&key) == Some(&value) {
                return false;
            }
            values.insert(key, value.clone());
            self.callbacks(key)
        };
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Re-send the current value to all subscribers.
    pub fn bump(&self, key: Key) {
        if let Some(value) = self.get(key) {
            self.notify(key, &value);
        }
    }

    /// Atomically take a value out of the store.
    pub fn steal(&self, key: Key) -> Option<Value> {
        self.values().remove(&key)
    }

    /// Request a change of the displayed page.
    pub fn request_page(&self, request: PageRequest) {
        // Always notify, repeated identical requests are meaningful
        let value = Value::Page(request);
        let callbacks = {
            let mut values = self.values();
            values.insert(Key::DisplayedPage, value.clone());
            self.callbacks(Key::DisplayedPage)
        };
        for callback in callbacks {
            callback(&value);
        }
    }

    /// Subscribe and immediately receive the current value, if set.
    pub fn subscribe<F>(&self, key: Key, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let subscription = self.register(key, Arc::clone(&callback));
        let current = self.values().get(&key).cloned();
        match current {
            Some(value) => callback(&value),
            None if !self.get_bool(Key::TestMode) => {
                log::debug!("Subscribing to unset variable {}", key);
            }
            None => {}
        }
        subscription
    }

    /// Subscribe to future changes only.
    pub fn subscribe_delayed<F>(&self, key: Key, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(key, Arc::new(callback))
    }

    /// Subscribe to future changes and take the value set before.
    ///
    /// Every write lands either in the returned value or in the callback,
    /// never in both.
    pub fn subscribe_taking<F>(&self, key: Key, callback: F) -> (Subscription, Option<Value>)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut values = self.values();
        let subscription = self.register(key, Arc::new(callback));
        (subscription, values.remove(&key))
    }

    /// Remove an observer by identity.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id);
    }

    /// Number of observers registered for a key.
    pub fn subscriber_count(&self, key: Key) -> usize {
        lock_or_recover(&self.inner.subscribers, "subscriber")
            .get(&key)
            .map_or(0, Vec::len)
    }

    fn register(&self, key: Key, callback: Callback) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock_or_recover(&self.inner.subscribers, "subscriber")
            .entry(key)
            .or_default()
            .push((id, callback));
        Subscription {
            id,
            key,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Snapshot of the observers of `key`. Writers take it while holding the
    /// value lock, so it matches the value they stored.
    fn callbacks(&self, key: Key) -> Vec<Callback> {
        lock_or_recover(&self.inner.subscribers, "subscriber")
            .get(&key)
            .map(|list| list.iter().map(|(_, callback)| Arc::clone(callback)).collect())
            .unwrap_or_default()
    }

    fn notify(&self, key: Key, value: &Value) {
        for callback in self.callbacks(key) {
            callback(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Step;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_set_reports_changes() {
        let store = ConfigStore::default();
        assert!(store.set(Key::Timezone, Value::text("Europe/Berlin")));
        assert!(!store.set(Key::Timezone, Value::text("Europe/Berlin")));
        assert_eq!(store.get_text(Key::Timezone), "Europe/Berlin");
    }

    #[test]
    fn test_fallbacks_do_not_count_as_set() {
        let store = ConfigStore::default();
        assert!(!store.has(Key::Disk));
        assert_eq!(store.get(Key::Disk), Some(Value::pair("/dev/null", "Test Dummy")));
        assert_eq!(store.get(Key::SendNotification), None);
    }

    #[test]
    fn test_steal_clears_value() {
        let store = ConfigStore::default();
        store.set(Key::UserName, Value::text("Ada"));
        assert_eq!(store.steal(Key::UserName), Some(Value::text("Ada")));
        assert!(!store.has(Key::UserName));
        assert_eq!(store.steal(Key::UserName), None);
    }

    #[test]
    fn test_subscribe_receives_current_and_future_values() {
        let store = ConfigStore::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(Key::InternetConnection, move |value| {
            sink.lock().unwrap().push(value.as_bool());
        });
        store.set(Key::InternetConnection, Value::Bool(true));
        assert_eq!(*seen.lock().unwrap(), vec![Some(false), Some(true)]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let store = ConfigStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = store.subscribe_delayed(Key::Locale, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.subscriber_count(Key::Locale), 1);

        store.set(Key::Locale, Value::text("de_DE.UTF-8"));
        drop(sub);
        store.set(Key::Locale, Value::text("fr_FR.UTF-8"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(Key::Locale), 0);
    }

    #[test]
    fn test_subscribe_taking_splits_old_and_new_writes() {
        let store = ConfigStore::default();
        store.request_page(PageRequest::Show(Step::Failed));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (_sub, pending) = store.subscribe_taking(Key::DisplayedPage, move |value| {
            sink.lock().unwrap().push(value.clone());
        });
        assert_eq!(pending, Some(Value::Page(PageRequest::Show(Step::Failed))));
        assert!(seen.lock().unwrap().is_empty());

        store.request_page(PageRequest::Next { from: None });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::Page(PageRequest::Next { from: None })]
        );
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let store = ConfigStore::default();
        let sub = store.subscribe_delayed(Key::Timezone, |_| {});
        store.unsubscribe(sub.id());
        assert_eq!(store.subscriber_count(Key::Timezone), 0);
    }

    #[test]
    fn test_bump_resends_value() {
        let store = ConfigStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _sub = store.subscribe_delayed(Key::Timezone, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.bump(Key::Timezone);
        store.bump(Key::Timezone);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_script_values() {
        assert_eq!(Value::Bool(true).to_script_value(), "1");
        assert_eq!(Value::Bool(false).to_script_value(), "0");
        assert_eq!(Value::pair("us", "English (US)").to_script_value(), "us");
        assert_eq!(Value::pair("us", "English (US)").to_string(), "English (US) (us)");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(Key::InstallationRunning.to_string(), "installation_running");
        assert_eq!("user_username".parse::<Key>(), Ok(Key::UserUsername));
    }
}
