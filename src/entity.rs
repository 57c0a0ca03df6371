use std::collections::HashMap;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

/// A bag of key-value properties describing an entity, transaction or state update. Values can be
/// nested JSON structures.
pub type Properties = HashMap<String, serde_json::Value>;

/// Kind of an entity tracked by Splyt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    /// An application user.
    User,
    /// The device the application runs on.
    Device,
}

/// Identity record (id and properties) for a user or a device.
///
/// ```
/// # use splyt::EntityInfo;
/// let user = EntityInfo::user("u1").with_property("level", 3);
/// let device = EntityInfo::device().override_id("my-device");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInfo {
    kind: EntityKind,
    id: Option<String>,
    properties: Properties,
}

impl EntityInfo {
    /// Create a user info with the specified id.
    pub fn user(id: impl Into<String>) -> EntityInfo {
        let id = id.into();
        EntityInfo {
            kind: EntityKind::User,
            id: (!id.is_empty()).then_some(id),
            properties: Properties::new(),
        }
    }

    /// Create a device info. The device id is detected during initialization unless overridden
    /// with [`EntityInfo::override_id`].
    pub fn device() -> EntityInfo {
        EntityInfo {
            kind: EntityKind::Device,
            id: None,
            properties: Properties::new(),
        }
    }

    /// Replace the entity id. An empty id clears it.
    pub fn override_id(mut self, id: impl Into<String>) -> EntityInfo {
        let id = id.into();
        self.id = (!id.is_empty()).then_some(id);
        self
    }

    /// Merge `properties` into the property bag.
    pub fn with_properties(mut self, properties: Properties) -> EntityInfo {
        self.properties.extend(properties);
        self
    }

    /// Set a single property.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> EntityInfo {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The kind of this entity.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The entity id, if known.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The property bag.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub(crate) fn merge_properties(&mut self, properties: Properties) {
        self.properties.extend(properties);
    }

    /// Resolve a device id. An override wins, then `saved` (an id persisted by an earlier
    /// session), then a freshly generated random id.
    pub(crate) fn resolve_device_id(&mut self, saved: Option<String>) -> &str {
        self.id
            .get_or_insert_with(|| saved.unwrap_or_else(generate_device_id))
    }
}

/// 128 random bits rendered as lowercase hex.
fn generate_device_id() -> String {
    let bits: u128 = thread_rng().gen();
    format!("{bits:032x}")
}
