//! Lifecycle tracking for transactions: begin, update, end and timeout.
//!
//! A transaction is identified by a [`TransactionKey`] (category and optional id). The tracker
//! only holds *active* transactions; ending or timing out removes the transaction and produces a
//! [`TransactionRecord`] that gets queued for delivery to the backend.
use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Properties, Result};

/// A default result string indicating a successful transaction completion.
pub const TXN_SUCCESS: &str = "success";
/// A default result string indicating an unsuccessful transaction completion.
pub const TXN_ERROR: &str = "error";
/// Result assigned to transactions finalized by their timeout.
pub const TXN_TIMEOUT: &str = "timeout";

/// Designates the activity that keeps a transaction open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutMode {
    /// Only this transaction's own timer matters. Its deadline is fixed at `begin`.
    #[default]
    #[serde(rename = "TXN")]
    Transaction,
    /// The transaction is kept open by activity (begin or update) of any transaction in the same
    /// category.
    #[serde(rename = "ANY")]
    Any,
}

impl TimeoutMode {
    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutMode::Transaction => "TXN",
            TimeoutMode::Any => "ANY",
        }
    }
}

impl fmt::Display for TimeoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a transaction: category plus an optional id, which is only required when several
/// transactions of the same category may be active at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionKey {
    /// Transaction category.
    pub category: String,
    /// Transaction id within the category.
    pub transaction_id: Option<String>,
}

impl TransactionKey {
    /// Create a key. An empty id is treated as no id.
    pub fn new(category: impl Into<String>, transaction_id: Option<&str>) -> TransactionKey {
        TransactionKey {
            category: category.into(),
            transaction_id: transaction_id
                .filter(|it| !it.is_empty())
                .map(str::to_owned),
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transaction_id {
            Some(id) => write!(f, "{}/{}", self.category, id),
            None => f.write_str(&self.category),
        }
    }
}

/// A finalized transaction, ready to be sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Transaction category.
    pub category: String,
    /// Transaction id, if any.
    pub transaction_id: Option<String>,
    /// All properties reported during the lifetime of the transaction.
    pub properties: Properties,
    /// When the transaction began.
    pub started_at: DateTime<Utc>,
    /// Time between begin and finalization.
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// Last reported progress (0–100).
    pub progress: u8,
    /// Every progress value reported by updates, in order.
    pub progress_history: Vec<u8>,
    /// Application defined result, or [`TXN_TIMEOUT`].
    pub result: String,
    /// Whether the transaction was finalized by its timeout.
    pub timed_out: bool,
    /// Timeout mode the transaction was begun with.
    pub timeout_mode: TimeoutMode,
}

#[derive(Debug)]
struct ActiveTransaction {
    properties: Properties,
    started_at: DateTime<Utc>,
    began: Instant,
    timeout: Duration,
    mode: TimeoutMode,
    /// Last activity relevant to this transaction's timer.
    touched: Instant,
    progress: u8,
    progress_history: Vec<u8>,
}

impl ActiveTransaction {
    fn deadline(&self) -> Option<Instant> {
        if self.timeout.is_zero() {
            return None;
        }
        let anchor = match self.mode {
            TimeoutMode::Transaction => self.began,
            TimeoutMode::Any => self.touched,
        };
        Some(anchor + self.timeout)
    }

    fn finalize(self, key: TransactionKey, now: Instant, result: String) -> TransactionRecord {
        let timed_out = result == TXN_TIMEOUT;
        TransactionRecord {
            category: key.category,
            transaction_id: key.transaction_id,
            properties: self.properties,
            started_at: self.started_at,
            elapsed: now.saturating_duration_since(self.began),
            progress: self.progress,
            progress_history: self.progress_history,
            result,
            timed_out,
            timeout_mode: self.mode,
        }
    }
}

/// Tracks active transactions.
///
/// All methods take the current instant explicitly so that timeout behavior is deterministic;
/// the session passes `Instant::now()`.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    active: Mutex<HashMap<TransactionKey, ActiveTransaction>>,
}

impl TransactionTracker {
    /// Create an empty tracker.
    pub fn new() -> TransactionTracker {
        TransactionTracker::default()
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionKey, ActiveTransaction>> {
        // Transactions are plain data; a panic while holding the lock cannot leave them
        // half-updated in a way that matters, so recover from poisoning.
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyActive`] if a transaction with the same key is active.
    pub fn begin(
        &self,
        key: TransactionKey,
        properties: Properties,
        timeout: Duration,
        mode: TimeoutMode,
        now: Instant,
    ) -> Result<()> {
        let mut active = self.active();
        if active.contains_key(&key) {
            return Err(Error::AlreadyActive);
        }
        touch_category(&mut active, &key.category, now);
        active.insert(
            key,
            ActiveTransaction {
                properties,
                started_at: Utc::now(),
                began: now,
                timeout,
                mode,
                touched: now,
                progress: 0,
                progress_history: Vec::new(),
            },
        );
        Ok(())
    }

    /// Report progress on an active transaction. `progress` is clamped to `0..=100`.
    ///
    /// # Errors
    ///
    /// [`Error::NotActive`] if the transaction is not active. Tracker state is left unchanged.
    pub fn update(
        &self,
        key: &TransactionKey,
        properties: Properties,
        progress: i32,
        now: Instant,
    ) -> Result<()> {
        let mut active = self.active();
        let transaction = active.get_mut(key).ok_or(Error::NotActive)?;

        // Lossless: the value is clamped into u8 range first.
        let progress = progress.clamp(0, 100) as u8;
        transaction.properties.extend(properties);
        transaction.progress = progress;
        transaction.progress_history.push(progress);

        touch_category(&mut active, &key.category, now);
        Ok(())
    }

    /// End an active transaction, returning its record.
    ///
    /// # Errors
    ///
    /// [`Error::NotActive`] if the transaction is not active.
    pub fn end(
        &self,
        key: &TransactionKey,
        properties: Properties,
        result: impl Into<String>,
        now: Instant,
    ) -> Result<TransactionRecord> {
        let mut active = self.active();
        let (key, mut transaction) = active.remove_entry(key).ok_or(Error::NotActive)?;
        transaction.properties.extend(properties);
        Ok(transaction.finalize(key, now, result.into()))
    }

    /// Begin and immediately end a transaction.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyActive`] if a transaction with the same key is active.
    pub fn begin_and_end(
        &self,
        key: TransactionKey,
        properties: Properties,
        result: impl Into<String>,
        now: Instant,
    ) -> Result<TransactionRecord> {
        let mut active = self.active();
        if active.contains_key(&key) {
            return Err(Error::AlreadyActive);
        }
        touch_category(&mut active, &key.category, now);
        let transaction = ActiveTransaction {
            properties,
            started_at: Utc::now(),
            began: now,
            timeout: Duration::ZERO,
            mode: TimeoutMode::default(),
            touched: now,
            progress: 0,
            progress_history: Vec::new(),
        };
        Ok(transaction.finalize(key, now, result.into()))
    }

    /// Finalize every transaction whose deadline is at or before `now`.
    ///
    /// Each expired transaction is returned exactly once, with result [`TXN_TIMEOUT`].
    pub fn expire(&self, now: Instant) -> Vec<TransactionRecord> {
        let mut active = self.active();
        let expired: Vec<TransactionKey> = active
            .iter()
            .filter(|(_, transaction)| transaction.deadline().is_some_and(|it| it <= now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| active.remove_entry(&key))
            .map(|(key, transaction)| transaction.finalize(key, now, TXN_TIMEOUT.to_owned()))
            .collect()
    }

    /// The earliest deadline among active transactions.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active()
            .values()
            .filter_map(ActiveTransaction::deadline)
            .min()
    }

    /// Whether the transaction is active.
    pub fn is_active(&self, key: &TransactionKey) -> bool {
        self.active().contains_key(key)
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.active().len()
    }
}

/// Reset idle timers of `ANY`-mode transactions in `category`.
fn touch_category(
    active: &mut HashMap<TransactionKey, ActiveTransaction>,
    category: &str,
    now: Instant,
) {
    active
        .iter_mut()
        .filter(|(key, transaction)| {
            key.category == category && transaction.mode == TimeoutMode::Any
        })
        .for_each(|(_, transaction)| transaction.touched = now);
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
