//! The Rust client core for Splyt, an analytics and tuning platform for applications and games.
//!
//! # Overview
//!
//! The SDK revolves around a [`Session`]. A session is initialized once with [`InitParams`] and
//! then:
//!
//! - tracks the identity of the device and of registered users ([`EntityInfo`]);
//! - records [transactions](Transaction): named units of user activity with a begin, progress
//!   updates and an end (or a timeout);
//! - serves tuning variables fetched from the backend, with [`Session::get_var`] never blocking
//!   and never failing;
//! - batches telemetry events and delivers them in the background.
//!
//! Operations that talk to the backend report their outcome through a callback that is invoked
//! exactly once, from a background worker thread.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Platform bridges that need numeric result codes
//! can convert errors to [`SplytError`].
//!
//! State updates and transaction ends never return errors: misuse such as ending a transaction
//! that already timed out is logged and otherwise ignored. Beginning and updating a transaction
//! return a [`Result`], so callers can tell when a key is already active or no longer active.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, under the `splyt` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the `splyt` crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod backend;
mod callback;
mod config;
mod depot;
mod entity;
mod error;
mod event;
mod event_queue;
mod housekeeper;
mod identity_store;
mod instrumentation;
mod notification;
mod purchase;
mod session;
mod transaction;
mod tuning_store;
mod worker;

pub use backend::{Backend, HttpBackend, HttpBackendConfig};
pub use callback::{Callback, Operation};
pub use config::{InitParams, NotificationConfig};
pub use entity::{EntityInfo, EntityKind, Properties};
pub use error::{Error, Result, SplytError};
pub use event::{CollectionUpdate, Event, EventPayload, StateUpdate, TimeoutListener};
pub use instrumentation::Transaction;
pub use notification::{Notification, NotificationListener};
pub use purchase::{PurchaseTransaction, PURCHASE_CATEGORY, UNKNOWN_CURRENCY};
pub use session::Session;
pub use transaction::{
    TimeoutMode, TransactionKey, TransactionRecord, TransactionTracker, TXN_ERROR, TXN_SUCCESS,
    TXN_TIMEOUT,
};
pub use tuning_store::{TuningSnapshot, TuningStore};
