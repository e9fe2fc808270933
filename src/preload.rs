//! Background preloading of flow data.
//!
//! Data needed by later steps (choices, desktops, disks) is loaded on a
//! background thread as soon as the flow starts. Each load is a [`Preload`]:
//! consumers join it explicitly with [`Preload::wait`] before first use, or
//! register a one-shot [`Preload::on_ready`] notification.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::choices::{parse_choices, Choice};
use crate::config::{lock_or_recover, ConfigStore, Key, Value};
use crate::desktop::{parse_desktops, Desktop};
use crate::disk::{Disk, DiskSource};

type ReadyCallback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

struct Slot<T> {
    value: Option<Arc<T>>,
    callbacks: Vec<ReadyCallback<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn complete(&self, value: T) {
        let value = Arc::new(value);
        let callbacks = {
            let mut slot = lock_or_recover(&self.slot, "preload");
            slot.value = Some(Arc::clone(&value));
            std::mem::take(&mut slot.callbacks)
        };
        self.ready.notify_all();
        for callback in callbacks {
            callback(&value);
        }
    }
}

/// A value being loaded in the background.
pub struct Preload<T> {
    name: &'static str,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Preload<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Preload<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preload")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Preload<T> {
    fn pending(name: &'static str) -> Self {
        Self {
            name,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    value: None,
                    callbacks: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Run `load` on a background thread. A panicking loader yields
    /// `T::default()` so waiters are never stranded.
    pub fn spawn<F>(name: &'static str, load: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
        T: Default,
    {
        let preload = Self::pending(name);
        let shared = Arc::clone(&preload.shared);
        std::thread::spawn(move || {
            let start = Instant::now();
            let value = std::panic::catch_unwind(std::panic::AssertUnwindSafe(load))
                .unwrap_or_else(|_| {
                    log::error!("Preloading {} panicked, using empty data", name);
                    T::default()
                });
            log::debug!("Preloaded {} in {:?}", name, start.elapsed());
            shared.complete(value);
        });
        preload
    }

    /// An already available value.
    pub fn ready(name: &'static str, value: T) -> Self {
        let preload = Self::pending(name);
        preload.shared.complete(value);
        preload
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_ready(&self) -> bool {
        lock_or_recover(&self.shared.slot, "preload").value.is_some()
    }

    /// The value if loading finished.
    pub fn try_get(&self) -> Option<Arc<T>> {
        lock_or_recover(&self.shared.slot, "preload").value.clone()
    }

    /// Block until the value is loaded.
    pub fn wait(&self) -> Arc<T> {
        let mut slot = lock_or_recover(&self.shared.slot, "preload");
        loop {
            if let Some(value) = &slot.value {
                return Arc::clone(value);
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block until the value is loaded or `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<T>> {
        let slot = lock_or_recover(&self.shared.slot, "preload");
        let (slot, _) = self
            .shared
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.value.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.value.clone()
    }

    /// Call `callback` once the value is loaded. Runs immediately on the
    /// calling thread if it already is, otherwise on the loading thread.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut slot = lock_or_recover(&self.shared.slot, "preload");
            match &slot.value {
                Some(value) => Arc::clone(value),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&value);
    }
}

/// Parsed additional software and feature choices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoiceSets {
    pub software: Vec<Choice>,
    pub features: Vec<Choice>,
}

/// Parse the configured choices and publish them as the initial selection.
pub fn preload_choices(config: &ConfigStore) -> Preload<ChoiceSets> {
    let config = config.clone();
    Preload::spawn("choices", move || {
        let settings = config.settings();
        let sets = ChoiceSets {
            software: parse_choices(&settings.additional_software),
            features: parse_choices(&settings.additional_features),
        };
        config.set(Key::FeatureChoices, Value::Choices(sets.features.clone()));
        config.set(Key::SoftwareChoices, Value::Choices(sets.software.clone()));
        sets
    })
}

/// Parse the configured desktops. The first one becomes the default choice.
pub fn preload_desktops(config: &ConfigStore) -> Preload<Vec<Desktop>> {
    let config = config.clone();
    Preload::spawn("desktops", move || {
        let desktops = parse_desktops(&config.settings().desktop, Path::exists);
        if let Some(first) = desktops.first() {
            config.set(Key::DesktopChosen, Value::text(first.keyword.clone()));
        }
        desktops
    })
}

/// Enumerate disks from `source`.
pub fn preload_disks(source: Arc<dyn DiskSource>) -> Preload<Vec<Disk>> {
    Preload::spawn("disks", move || match source.disks() {
        Ok(disks) => disks,
        Err(e) => {
            log::error!("Could not enumerate disks: {:#}", e);
            Vec::new()
        }
    })
}
