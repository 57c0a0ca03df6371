//! The worker thread executing asynchronous session operations in FIFO order.
use std::{
    panic::AssertUnwindSafe,
    sync::{mpsc::Receiver, Arc},
    thread::JoinHandle,
};

use crate::{
    backend::{Backend, HttpBackend, HttpBackendConfig},
    callback::Completion,
    depot::{Depot, DepotState},
    entity::EntityKind,
    session::{lock, read, write, Listeners, SessionState, Shared},
    EntityInfo, Error, InitParams, Result,
};

/// A unit of work for the worker thread.
pub(crate) enum Job {
    Init {
        params: Box<InitParams>,
        completion: Completion,
    },
    RegisterUser {
        user: EntityInfo,
        completion: Completion,
    },
    RefreshTuning {
        completion: Completion,
    },
    /// Deliver an error without doing any work, e.g. for operations issued before init.
    Fail {
        completion: Completion,
        error: Error,
    },
    /// Deliver queued events.
    Flush,
    /// Write the device id to storage, along with the queued events if `events` is set.
    Persist { events: bool },
}

pub(crate) fn spawn(shared: Arc<Shared>, jobs: Receiver<Job>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("splyt-worker".to_owned())
        .spawn(move || {
            // Iteration ends once every sender is dropped and the queue is drained, so queued
            // callbacks are still delivered on shutdown.
            for job in jobs {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| shared.run(job)));
                if result.is_err() {
                    log::error!(target: "splyt", "worker job panicked");
                }
            }
            log::debug!(target: "splyt", "worker thread exiting");
        })
}

/// Saved state is best effort: an unreadable file is logged and treated as empty.
fn load_saved_state(depot: &Depot) -> Option<DepotState> {
    depot
        .load()
        .map_err(|err| log::warn!(target: "splyt", "failed to load saved session state: {err}"))
        .ok()
        .flatten()
}

impl Shared {
    fn run(&self, job: Job) {
        match job {
            Job::Init { params, completion } => {
                let result = self.init(*params);
                completion.complete(result);
            }
            Job::RegisterUser { user, completion } => {
                completion.complete(self.register_user(user));
            }
            Job::RefreshTuning { completion } => {
                completion.complete(self.refresh_tuning());
            }
            Job::Fail { completion, error } => {
                log::debug!(target: "splyt", operation = completion.operation().event_name(); "failing operation: {error}");
                completion.complete(Err(error));
            }
            Job::Flush => self.flush(),
            Job::Persist { events } => self.persist(events),
        }
    }

    fn init(&self, params: InitParams) -> Result<()> {
        match self.try_init(params) {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                log::info!(target: "splyt", device_id = lock(&self.identity).device_id().as_str(); "splyt session initialized");

                // Defaults are served until the next successful refresh.
                if let Err(err) = self.refresh_tuning() {
                    log::warn!(target: "splyt", "failed to fetch tuning during init: {err}");
                }
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "splyt", "splyt session init failed: {err}");
                self.set_state(SessionState::Uninitialized);
                Err(err)
            }
        }
    }

    fn try_init(&self, params: InitParams) -> Result<()> {
        let host = params.validate()?;

        let backend = match self.backend() {
            Some(backend) => backend,
            None => {
                let backend = HttpBackend::new(HttpBackendConfig {
                    host,
                    customer_id: params.customer_id.clone(),
                    sdk_name: params.sdk_name.clone(),
                    sdk_version: params.sdk_version.clone(),
                    request_timeout: params.request_timeout,
                    log_enabled: params.log_enabled,
                })?;
                Arc::new(backend) as Arc<dyn Backend>
            }
        };

        let InitParams {
            user,
            mut device,
            notification,
            notification_listener,
            timeout_listener,
            storage_path,
            ..
        } = params;

        let depot = storage_path.as_deref().map(Depot::new);
        let saved = depot.as_ref().and_then(load_saved_state).unwrap_or_default();

        device.resolve_device_id(saved.device_id);
        let user = user.id().is_some().then_some(user);

        backend.init_application(user.as_ref(), &device)?;

        if !saved.events.is_empty() {
            log::debug!(target: "splyt", count = saved.events.len(); "restoring saved events");
            self.events.restore(saved.events);
        }

        {
            let mut identity = lock(&self.identity);
            identity.set_device(device);
            if let Some(user) = user {
                identity.register_user(user);
            }
        }
        *write(&self.backend) = Some(backend);
        *write(&self.listeners) = Listeners {
            notification: notification_listener,
            timeout: timeout_listener,
        };
        if let Some(depot) = depot {
            *write(&self.depot) = Some(depot);
            // Restored events live in the queue now; keep only the device id on disk.
            self.persist(false);
        }

        log::debug!(target: "splyt",
                    notification_host = notification.host.as_str(),
                    small_icon = notification.small_icon,
                    always_post = notification.always_post,
                    disable_auto_clear = notification.disable_auto_clear;
                    "registered for push notifications");
        Ok(())
    }

    fn register_user(&self, user: EntityInfo) -> Result<()> {
        if user.kind() != EntityKind::User || user.id().is_none() {
            log::warn!(target: "splyt", "register_user requires a user info with an id");
            return Err(Error::InvalidArgument);
        }
        let backend = self.backend().ok_or(Error::NotInitialized)?;
        let device_id = lock(&self.identity).device_id();

        backend.update_user(&user, &device_id)?;
        lock(&self.identity).register_user(user);

        if let Err(err) = self.refresh_tuning() {
            log::warn!(target: "splyt", "failed to fetch tuning for registered user: {err}");
        }
        Ok(())
    }

    fn refresh_tuning(&self) -> Result<()> {
        let backend = self.backend().ok_or(Error::NotInitialized)?;
        let (device_id, user_ids) = {
            let identity = lock(&self.identity);
            (identity.device_id(), identity.user_ids())
        };

        let snapshot = backend.fetch_tuning(&device_id, &user_ids)?;
        self.tuning.set_snapshot(snapshot);

        log::debug!(target: "splyt", "successfully refreshed tuning");
        Ok(())
    }

    fn persist(&self, events: bool) {
        let depot = read(&self.depot);
        let Some(depot) = depot.as_ref() else {
            return;
        };
        let device_id = lock(&self.identity).device_id();
        let events = if events {
            self.events.snapshot()
        } else {
            Vec::new()
        };
        let count = events.len();

        match depot.save(&device_id, events) {
            Ok(()) => log::debug!(target: "splyt", count; "saved session state"),
            Err(err) => log::warn!(target: "splyt", "failed to save session state: {err}"),
        }
    }

    fn flush(&self) {
        let Some(backend) = self.backend() else {
            return;
        };

        loop {
            let batch = self.events.next_batch();
            if batch.is_empty() {
                return;
            }

            match backend.send_events(&batch) {
                Ok(()) => {
                    log::debug!(target: "splyt", count = batch.len(); "delivered events");
                    self.events.record_delivery(true);
                }
                Err(err @ (Error::NetworkError | Error::Timeout)) => {
                    // Connectivity trouble; keep the events and slow down.
                    log::warn!(target: "splyt", count = batch.len(); "failed to deliver events: {err}");
                    self.events.requeue_front(batch);
                    self.events.record_delivery(false);
                    return;
                }
                Err(err) => {
                    // The backend answered, so resending the same batch would not help.
                    log::warn!(target: "splyt", count = batch.len(); "backend rejected events, dropping batch: {err}");
                    self.events.record_delivery(true);
                }
            }
        }
    }
}
