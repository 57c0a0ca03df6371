//! A thread-safe in-memory storage for the last fetched tuning variables. [`TuningStore`] provides
//! concurrent access for readers (variable lookups) and the writer (tuning refresh).
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

/// Tuning variables as returned by the backend: values for the device, and values for each
/// registered user. User values take precedence over device values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningSnapshot {
    /// Device-level values.
    #[serde(default)]
    pub device: HashMap<String, String>,
    /// User-level values keyed by user id.
    #[serde(default)]
    pub users: HashMap<String, HashMap<String, String>>,
}

impl TuningSnapshot {
    fn lookup(&self, user_id: Option<&str>, name: &str) -> Option<&str> {
        user_id
            .and_then(|user_id| self.users.get(user_id))
            .and_then(|vars| vars.get(name))
            .or_else(|| self.device.get(name))
            .map(String::as_str)
    }
}

/// `TuningStore` provides a Sync storage for tuning variables. The snapshot is immutable and can
/// only be replaced completely, so readers never observe a partially refreshed cache.
#[derive(Default)]
pub struct TuningStore {
    snapshot: RwLock<Option<Arc<TuningSnapshot>>>,
}

impl TuningStore {
    /// Create an empty store.
    pub fn new() -> TuningStore {
        TuningStore::default()
    }

    /// Get the current snapshot. Returns `None` if tuning has never been fetched.
    pub fn get_snapshot(&self) -> Option<Arc<TuningSnapshot>> {
        // A writer only swaps an `Arc` while holding the lock, so a poisoned lock still holds a
        // consistent value.
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshot.clone()
    }

    /// Replace the whole snapshot, returning the previous one.
    pub fn set_snapshot(&self, snapshot: TuningSnapshot) -> Option<Arc<TuningSnapshot>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(snapshot));

        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, new_value)
    }

    /// Look up `name` for `user_id` (falling back to device values), or return `default`.
    pub fn get_var(&self, user_id: Option<&str>, name: &str, default: &str) -> String {
        let Some(snapshot) = self.get_snapshot() else {
            log::trace!(target: "splyt", name; "tuning variable requested before tuning has been fetched");
            return default.to_owned();
        };
        snapshot
            .lookup(user_id, name)
            .unwrap_or(default)
            .to_owned()
    }

    /// Like [`TuningStore::get_var`] but parses the value, returning `default` if the value is
    /// missing or cannot be parsed as `T`.
    pub fn get_var_as<T: FromStr>(&self, user_id: Option<&str>, name: &str, default: T) -> T {
        let Some(snapshot) = self.get_snapshot() else {
            return default;
        };
        match snapshot.lookup(user_id, name).map(str::parse::<T>) {
            Some(Ok(value)) => value,
            Some(Err(_)) => {
                log::debug!(target: "splyt", name; "tuning variable has unexpected type, using default");
                default
            }
            None => default,
        }
    }
}
