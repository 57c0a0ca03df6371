//! Current user and device identity.
use std::collections::HashMap;

use crate::{EntityInfo, Error, Properties, Result};

/// Holds the device identity, every user registered during this session and which of them is
/// currently active.
///
/// Not synchronized itself; the session keeps it behind a mutex.
#[derive(Debug, Default)]
pub(crate) struct IdentityStore {
    device: Option<EntityInfo>,
    users: HashMap<String, EntityInfo>,
    active_user: Option<String>,
}

impl IdentityStore {
    pub fn new() -> IdentityStore {
        IdentityStore::default()
    }

    /// Replace the device identity. The device id must already be resolved.
    pub fn set_device(&mut self, device: EntityInfo) {
        self.device = Some(device);
    }

    /// Remember `user` and make it the active user. Users without an id are ignored.
    pub fn register_user(&mut self, user: EntityInfo) {
        let Some(id) = user.id().map(str::to_owned) else {
            return;
        };
        match self.users.get_mut(&id) {
            Some(existing) => existing.merge_properties(user.properties().clone()),
            None => {
                self.users.insert(id.clone(), user);
            }
        }
        self.active_user = Some(id);
    }

    pub fn set_active_user(&mut self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.users
            .entry(id.to_owned())
            .or_insert_with(|| EntityInfo::user(id));
        self.active_user = Some(id.to_owned());
        Ok(())
    }

    pub fn clear_active_user(&mut self) {
        self.active_user = None;
    }

    /// Active user id, or an empty string.
    pub fn user_id(&self) -> String {
        self.active_user.clone().unwrap_or_default()
    }

    /// Device id, or an empty string before initialization.
    pub fn device_id(&self) -> String {
        self.device
            .as_ref()
            .and_then(|it| it.id())
            .unwrap_or_default()
            .to_owned()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn update_device_properties(&mut self, properties: Properties) -> bool {
        match &mut self.device {
            Some(device) => {
                device.merge_properties(properties);
                true
            }
            None => false,
        }
    }

    /// Merge `properties` into the active user. Returns `false` if there is no active user.
    pub fn update_user_properties(&mut self, properties: Properties) -> bool {
        let Some(user) = self
            .active_user
            .as_ref()
            .and_then(|id| self.users.get_mut(id))
        else {
            return false;
        };
        user.merge_properties(properties);
        true
    }

    #[cfg(test)]
    pub fn user(&self, id: &str) -> Option<&EntityInfo> {
        self.users.get(id)
    }
}
