use chrono::{DateTime, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Properties, TransactionRecord};

/// A telemetry event waiting to be delivered to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Active user at the time the event was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Device id.
    pub device_id: String,
    /// What happened.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    /// A transaction was ended or timed out.
    Transaction(TransactionRecord),
    /// Device state was updated.
    DeviceState(StateUpdate),
    /// User state was updated.
    #[from(ignore)]
    UserState(StateUpdate),
    /// A collection balance changed.
    Collection(CollectionUpdate),
}

/// Properties merged into a device or user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// The merged properties.
    pub properties: Properties,
}

/// Balance change of an application defined collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionUpdate {
    /// Collection name.
    pub name: String,
    /// Current balance.
    pub balance: f64,
    /// Amount the balance changed by.
    pub balance_delta: f64,
    /// Whether the collection is an in-app virtual currency.
    pub is_currency: bool,
}

/// Receives transactions that were finalized by their timeout.
///
/// The listener is called from the session's housekeeping thread.
pub trait TimeoutListener {
    /// Called once per timed-out transaction.
    fn on_timeout(&self, record: &TransactionRecord);
}

impl<T: Fn(&TransactionRecord)> TimeoutListener for T {
    fn on_timeout(&self, record: &TransactionRecord) {
        self(record);
    }
}
