use std::time::Duration;

use crate::{Properties, Result, Session, TimeoutMode, TransactionKey, TXN_SUCCESS};

/// Describes a transaction and reports its lifecycle to a [`Session`].
///
/// Properties set on the handle are sent with the next lifecycle call and then cleared.
///
/// ```no_run
/// # use std::time::Duration;
/// # use splyt::{Session, TimeoutMode, TXN_SUCCESS};
/// # let session = Session::new()?;
/// let mut level = session
///     .transaction("level")
///     .id("1-1")
///     .with_property("difficulty", "hard");
/// level.begin(Duration::from_secs(300), TimeoutMode::Transaction)?;
/// level.update(50)?;
/// level.end(TXN_SUCCESS);
/// # Ok::<(), splyt::Error>(())
/// ```
pub struct Transaction<'a> {
    session: &'a Session,
    key: TransactionKey,
    properties: Properties,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(session: &'a Session, category: impl Into<String>) -> Transaction<'a> {
        Transaction {
            session,
            key: TransactionKey::new(category, None),
            properties: Properties::new(),
        }
    }

    /// Set the transaction id. Only required when several transactions of the same category may
    /// be active at once.
    pub fn id(mut self, transaction_id: impl Into<String>) -> Transaction<'a> {
        let transaction_id = transaction_id.into();
        self.key.transaction_id = (!transaction_id.is_empty()).then_some(transaction_id);
        self
    }

    /// Set a property.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Transaction<'a> {
        self.set_property(key, value);
        self
    }

    /// Merge `properties`.
    pub fn with_properties(mut self, properties: Properties) -> Transaction<'a> {
        self.properties.extend(properties);
        self
    }

    /// Set a property to be sent with the next lifecycle call.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// The key identifying this transaction.
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Begin the transaction. A zero `timeout` never expires.
    ///
    /// See [`Session::begin_transaction`] for errors.
    pub fn begin(&mut self, timeout: Duration, mode: TimeoutMode) -> Result<()> {
        let properties = std::mem::take(&mut self.properties);
        self.session
            .begin_transaction(self.key.clone(), properties, timeout, mode)
    }

    /// Report progress, from 0 to 100.
    ///
    /// See [`Session::update_transaction`] for errors.
    pub fn update(&mut self, progress: i32) -> Result<()> {
        let properties = std::mem::take(&mut self.properties);
        self.session
            .update_transaction(&self.key, properties, progress)
    }

    /// End the transaction with `result`, usually [`TXN_SUCCESS`](crate::TXN_SUCCESS) or
    /// [`TXN_ERROR`](crate::TXN_ERROR).
    pub fn end(&mut self, result: &str) {
        let properties = std::mem::take(&mut self.properties);
        self.session.end_transaction(&self.key, properties, result);
    }

    /// Begin and immediately end the transaction with [`TXN_SUCCESS`].
    pub fn begin_and_end(&mut self) {
        self.begin_and_end_with(TXN_SUCCESS);
    }

    /// Begin and immediately end the transaction with `result`.
    pub fn begin_and_end_with(&mut self, result: &str) {
        let properties = std::mem::take(&mut self.properties);
        self.session
            .begin_and_end_transaction(self.key.clone(), properties, result);
    }
}
