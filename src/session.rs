//! The Splyt session client.
use std::{
    str::FromStr,
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    backend::Backend,
    callback::{Completion, Operation},
    depot::Depot,
    event::{CollectionUpdate, Event, EventPayload, StateUpdate},
    event_queue::EventQueue,
    housekeeper::Housekeeper,
    identity_store::IdentityStore,
    instrumentation::Transaction,
    notification::NoopNotificationListener,
    purchase::PurchaseTransaction,
    worker::{self, Job},
    EntityInfo, Error, InitParams, Notification, NotificationListener, Properties, Result,
    TimeoutListener, TimeoutMode, TransactionKey, TransactionTracker, TuningStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
}

pub(crate) struct Listeners {
    pub notification: Arc<dyn NotificationListener + Send + Sync>,
    pub timeout: Option<Arc<dyn TimeoutListener + Send + Sync>>,
}

/// State shared between the session handle, the worker and the housekeeper.
pub(crate) struct Shared {
    pub state: Mutex<SessionState>,
    pub identity: Mutex<IdentityStore>,
    pub transactions: TransactionTracker,
    pub tuning: TuningStore,
    pub events: EventQueue,
    pub backend: RwLock<Option<Arc<dyn Backend>>>,
    pub listeners: RwLock<Listeners>,
    /// Set by init when a storage path is configured.
    pub depot: RwLock<Option<Depot>>,
}

// Every critical section leaves the guarded value consistent, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(backend: Option<Arc<dyn Backend>>) -> Shared {
        Shared {
            state: Mutex::new(SessionState::Uninitialized),
            identity: Mutex::new(IdentityStore::new()),
            transactions: TransactionTracker::new(),
            tuning: TuningStore::new(),
            events: EventQueue::new(),
            backend: RwLock::new(backend),
            listeners: RwLock::new(Listeners {
                notification: Arc::new(NoopNotificationListener),
                timeout: None,
            }),
            depot: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        read(&self.backend).clone()
    }

    fn active_user_id(&self) -> Option<String> {
        let user_id = lock(&self.identity).user_id();
        (!user_id.is_empty()).then_some(user_id)
    }

    /// Stamp `payload` with the current identity and queue it for delivery.
    ///
    /// Returns `true` if a full batch is waiting.
    pub fn record(&self, payload: EventPayload) -> bool {
        let (user_id, device_id) = {
            let identity = lock(&self.identity);
            let user_id = identity.user_id();
            ((!user_id.is_empty()).then_some(user_id), identity.device_id())
        };
        self.events.push(Event {
            timestamp: Utc::now(),
            user_id,
            device_id,
            payload,
        })
    }

    /// Finalize timed-out transactions, queue their records and notify the timeout listener.
    ///
    /// Returns `true` if a full batch is waiting.
    pub fn expire_transactions(&self, now: Instant) -> bool {
        let expired = self.transactions.expire(now);
        if expired.is_empty() {
            return false;
        }

        let listener = read(&self.listeners).timeout.clone();
        let mut flush = false;
        for record in expired {
            log::debug!(target: "splyt",
                        category = record.category.as_str(),
                        elapsed_secs = record.elapsed.as_secs_f64();
                        "transaction timed out");
            flush |= self.record(EventPayload::Transaction(record.clone()));
            if let Some(listener) = &listener {
                listener.on_timeout(&record);
            }
        }
        flush
    }
}

/// A Splyt session: identity, transactions, tuning variables and event delivery.
///
/// Operations talking to the backend ([`Session::init`], [`Session::register_user`],
/// [`Session::refresh_tuning`]) never block the caller. They run in FIFO order on a background
/// worker and report their outcome through a callback that is invoked exactly once, on the worker
/// thread. Every other operation is synchronous and never performs I/O.
///
/// ```no_run
/// # use splyt::{InitParams, Session, EntityInfo};
/// let session = Session::new()?;
/// session.init(
///     InitParams {
///         user: EntityInfo::user("u1"),
///         ..InitParams::new("acme")
///     },
///     |result| println!("init complete: {result:?}"),
/// );
/// # Ok::<(), splyt::Error>(())
/// ```
pub struct Session {
    pub(crate) shared: Arc<Shared>,
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    housekeeper: Option<Housekeeper>,
}

impl Session {
    /// Create a session that talks to the Splyt web services configured in [`InitParams`].
    ///
    /// Background threads are started immediately; the session must still be initialized with
    /// [`Session::init`].
    pub fn new() -> Result<Session> {
        Session::start(None)
    }

    /// Create a session with a custom [`Backend`]. Host and timeout settings of [`InitParams`] are
    /// not used in that case.
    pub fn with_backend(backend: Arc<dyn Backend>) -> Result<Session> {
        Session::start(Some(backend))
    }

    fn start(backend: Option<Arc<dyn Backend>>) -> Result<Session> {
        let shared = Arc::new(Shared::new(backend));
        let (jobs, receiver) = mpsc::channel();

        let worker = worker::spawn(shared.clone(), receiver)?;
        let housekeeper = Housekeeper::start(shared.clone(), jobs.clone())?;

        Ok(Session {
            shared,
            jobs: Some(jobs),
            worker: Some(worker),
            housekeeper: Some(housekeeper),
        })
    }

    fn submit(&self, job: Job) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        // On failure the job is dropped here, which completes any pending callback with an error.
        if jobs.send(job).is_err() {
            log::warn!(target: "splyt", "worker thread is gone, dropping job");
        }
    }

    /// Submit the job built from `completion` if the session is ready, or fail it.
    fn submit_when_ready(&self, completion: Completion, job: impl FnOnce(Completion) -> Job) {
        if self.shared.is_ready() {
            self.submit(job(completion));
        } else {
            log::warn!(target: "splyt", operation = completion.operation().event_name(); "session is not initialized");
            self.submit(Job::Fail {
                completion,
                error: Error::NotInitialized,
            });
        }
    }

    fn ready_for(&self, operation: &str) -> bool {
        let ready = self.shared.is_ready();
        if !ready {
            log::warn!(target: "splyt", operation; "ignoring call before session is initialized");
        }
        ready
    }

    /// Initialize the session.
    ///
    /// `callback` receives `Ok(())` once the backend acknowledged the application start. Tuning
    /// is fetched as part of initialization, but a tuning failure does not fail the init. A
    /// second `init` while the session is initializing or ready completes with
    /// [`Error::AlreadyActive`]; after a failed init the session can be initialized again.
    pub fn init(&self, params: InitParams, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(Operation::Init, Box::new(callback));
        let job = {
            let mut state = lock(&self.shared.state);
            if *state == SessionState::Uninitialized {
                *state = SessionState::Initializing;
                Job::Init {
                    params: Box::new(params),
                    completion,
                }
            } else {
                log::warn!(target: "splyt", "session is already initialized");
                Job::Fail {
                    completion,
                    error: Error::AlreadyActive,
                }
            }
        };
        self.submit(job);
    }

    /// Register a user with the backend. On success the user becomes the active user and tuning
    /// is refreshed.
    pub fn register_user(
        &self,
        user: EntityInfo,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let completion = Completion::new(Operation::RegisterUser, Box::new(callback));
        self.submit_when_ready(completion, |completion| Job::RegisterUser { user, completion });
    }

    /// Fetch tuning variables for the device and every registered user.
    ///
    /// On failure the previously cached values are kept.
    pub fn refresh_tuning(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(Operation::RefreshTuning, Box::new(callback));
        self.submit_when_ready(completion, |completion| Job::RefreshTuning { completion });
    }

    /// Whether [`Session::init`] has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Make a registered user the active user.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if the session is not initialized.
    /// - [`Error::InvalidArgument`] if `user_id` is empty.
    pub fn set_active_user(&self, user_id: &str) -> Result<()> {
        if !self.shared.is_ready() {
            return Err(Error::NotInitialized);
        }
        lock(&self.shared.identity).set_active_user(user_id)?;
        log::debug!(target: "splyt", user_id; "active user changed");
        Ok(())
    }

    /// Return to anonymous, device-only identity.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] if the session is not initialized.
    pub fn clear_active_user(&self) -> Result<()> {
        if !self.shared.is_ready() {
            return Err(Error::NotInitialized);
        }
        lock(&self.shared.identity).clear_active_user();
        Ok(())
    }

    /// Active user id, or an empty string.
    pub fn user_id(&self) -> String {
        lock(&self.shared.identity).user_id()
    }

    /// Device id, or an empty string before init.
    pub fn device_id(&self) -> String {
        lock(&self.shared.identity).device_id()
    }

    /// Get a tuning variable for the active user (falling back to the device value), or
    /// `default` if it is not set.
    pub fn get_var(&self, name: &str, default: &str) -> String {
        let user_id = self.shared.active_user_id();
        self.shared.tuning.get_var(user_id.as_deref(), name, default)
    }

    /// Like [`Session::get_var`], but parse the value. Returns `default` if the variable is not
    /// set or cannot be parsed.
    pub fn get_var_as<T: FromStr>(&self, name: &str, default: T) -> T {
        let user_id = self.shared.active_user_id();
        self.shared.tuning.get_var_as(user_id.as_deref(), name, default)
    }

    /// Stop sending events. Events are still recorded.
    ///
    /// With a [storage path](InitParams::storage_path), queued events are saved on the worker
    /// thread so they survive the application being killed while in the background.
    pub fn pause(&self) {
        if !self.ready_for("pause") {
            return;
        }
        self.shared.events.pause();
        log::debug!(target: "splyt", "event delivery paused");
        self.submit(Job::Persist { events: true });
    }

    /// Resume sending events and deliver everything recorded while paused.
    pub fn resume(&self) {
        if !self.ready_for("resume") {
            return;
        }
        self.shared.events.resume();
        log::debug!(target: "splyt", "event delivery resumed");
        // The saved events are still queued in memory.
        self.submit(Job::Persist { events: false });
        self.submit(Job::Flush);
    }

    /// Deliver queued events now instead of waiting for the next flush period.
    pub fn flush(&self) {
        if self.ready_for("flush") {
            self.submit(Job::Flush);
        }
    }

    fn record(&self, payload: EventPayload) {
        if self.shared.record(payload) {
            self.submit(Job::Flush);
        }
    }

    /// Merge `properties` into the device state.
    pub fn update_device_state(&self, properties: Properties) {
        if !self.ready_for("update_device_state") {
            return;
        }
        lock(&self.shared.identity).update_device_properties(properties.clone());
        self.record(EventPayload::DeviceState(StateUpdate { properties }));
    }

    /// Merge `properties` into the state of the active user. Ignored without an active user.
    pub fn update_user_state(&self, properties: Properties) {
        if !self.ready_for("update_user_state") {
            return;
        }
        if !lock(&self.shared.identity).update_user_properties(properties.clone()) {
            log::warn!(target: "splyt", "ignoring user state update without an active user");
            return;
        }
        self.record(EventPayload::UserState(StateUpdate { properties }));
    }

    /// Report the balance of an application defined collection.
    pub fn update_collection(
        &self,
        name: impl Into<String>,
        balance: f64,
        balance_delta: f64,
        is_currency: bool,
    ) {
        if !self.ready_for("update_collection") {
            return;
        }
        self.record(EventPayload::Collection(CollectionUpdate {
            name: name.into(),
            balance,
            balance_delta,
            is_currency,
        }));
    }

    /// Begin a transaction. A zero `timeout` never expires.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if the session is not initialized.
    /// - [`Error::AlreadyActive`] if a transaction with the same key is active. The active
    ///   transaction is left untouched.
    pub fn begin_transaction(
        &self,
        key: TransactionKey,
        properties: Properties,
        timeout: Duration,
        mode: TimeoutMode,
    ) -> Result<()> {
        if !self.ready_for("begin_transaction") {
            return Err(Error::NotInitialized);
        }
        let now = Instant::now();
        self.shared
            .transactions
            .begin(key.clone(), properties, timeout, mode, now)
            .map_err(|err| {
                log::warn!(target: "splyt", transaction:serde = key; "cannot begin transaction: {err}");
                err
            })
    }

    /// Report progress on an active transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if the session is not initialized.
    /// - [`Error::NotActive`] if the transaction is not active, e.g. because it timed out.
    pub fn update_transaction(
        &self,
        key: &TransactionKey,
        properties: Properties,
        progress: i32,
    ) -> Result<()> {
        if !self.ready_for("update_transaction") {
            return Err(Error::NotInitialized);
        }
        self.shared
            .transactions
            .update(key, properties, progress, Instant::now())
            .map_err(|err| {
                log::warn!(target: "splyt", transaction:serde = key; "cannot update transaction: {err}");
                err
            })
    }

    /// End an active transaction and queue its record. Ending an inactive transaction (e.g., one
    /// that already timed out) is logged and ignored.
    pub fn end_transaction(&self, key: &TransactionKey, properties: Properties, result: &str) {
        if !self.ready_for("end_transaction") {
            return;
        }
        match self
            .shared
            .transactions
            .end(key, properties, result, Instant::now())
        {
            Ok(record) => self.record(EventPayload::Transaction(record)),
            Err(err) => {
                log::warn!(target: "splyt", transaction:serde = key; "cannot end transaction: {err}");
            }
        }
    }

    /// Begin and immediately end a transaction.
    pub fn begin_and_end_transaction(
        &self,
        key: TransactionKey,
        properties: Properties,
        result: &str,
    ) {
        if !self.ready_for("begin_and_end_transaction") {
            return;
        }
        match self
            .shared
            .transactions
            .begin_and_end(key.clone(), properties, result, Instant::now())
        {
            Ok(record) => self.record(EventPayload::Transaction(record)),
            Err(err) => {
                log::warn!(target: "splyt", transaction:serde = key; "cannot begin and end transaction: {err}");
            }
        }
    }

    /// Start describing a transaction in `category`.
    pub fn transaction(&self, category: impl Into<String>) -> Transaction<'_> {
        Transaction::new(self, category)
    }

    /// Start describing a purchase transaction.
    pub fn purchase(&self) -> PurchaseTransaction<'_> {
        PurchaseTransaction::new(self)
    }

    /// Hand a push notification received by the platform transport to the session. The
    /// notification listener from [`InitParams`] is called on the current thread.
    pub fn notification_received(&self, message: Option<String>, was_launched_by: bool) {
        let notification = Notification {
            message,
            was_launched_by,
        };
        log::debug!(target: "splyt",
                    operation = Operation::NotificationReceived.event_name(),
                    was_launched_by;
                    "notification received");

        let listener = read(&self.shared.listeners).notification.clone();
        listener.on_notification(&notification);
    }

    /// Stop background threads and wait for them to exit.
    ///
    /// Jobs queued before shutdown are still executed, so every pending callback is invoked
    /// before this returns. Events that could not be delivered are saved if a
    /// [storage path](InitParams::storage_path) is configured.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(housekeeper) = self.housekeeper.take() {
            housekeeper.shutdown()?;
        }
        self.submit(Job::Persist { events: true });
        // Once the last sender is gone, the worker drains its queue and exits.
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| Error::Unknown)?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(housekeeper) = &self.housekeeper {
            housekeeper.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{mpsc, Arc, Mutex},
        time::{Duration, Instant},
    };

    use super::Session;
    use crate::{
        backend::Backend,
        event::{Event, EventPayload},
        EntityInfo, Error, InitParams, Notification, Properties, Result, TimeoutMode,
        TransactionKey, TransactionRecord, TuningSnapshot, TXN_SUCCESS, TXN_TIMEOUT,
    };

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct MockBackend {
        init_error: Mutex<Option<Error>>,
        tuning_error: Mutex<Option<Error>>,
        send_error: Mutex<Option<Error>>,
        tuning: Mutex<TuningSnapshot>,
        init_calls: Mutex<Vec<(Option<String>, String)>>,
        registered: Mutex<Vec<String>>,
        sent: Mutex<Vec<Event>>,
    }

    impl Backend for MockBackend {
        fn init_application(&self, user: Option<&EntityInfo>, device: &EntityInfo) -> Result<()> {
            self.init_calls.lock().unwrap().push((
                user.and_then(|it| it.id()).map(str::to_owned),
                device.id().unwrap_or_default().to_owned(),
            ));
            match *self.init_error.lock().unwrap() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn update_user(&self, user: &EntityInfo, _device_id: &str) -> Result<()> {
            self.registered
                .lock()
                .unwrap()
                .push(user.id().unwrap_or_default().to_owned());
            Ok(())
        }

        fn fetch_tuning(&self, _device_id: &str, _user_ids: &[String]) -> Result<TuningSnapshot> {
            match *self.tuning_error.lock().unwrap() {
                Some(err) => Err(err),
                None => Ok(self.tuning.lock().unwrap().clone()),
            }
        }

        fn send_events(&self, events: &[Event]) -> Result<()> {
            if let Some(err) = *self.send_error.lock().unwrap() {
                return Err(err);
            }
            self.sent.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn setup(backend: &Arc<MockBackend>) -> Session {
        init_logger();
        Session::with_backend(backend.clone()).unwrap()
    }

    /// Issue an asynchronous operation and wait for its callback.
    fn wait_for(issue: impl FnOnce(Box<dyn FnOnce(Result<()>) + Send>)) -> Result<()> {
        let (sender, receiver) = mpsc::channel();
        issue(Box::new(move |result| sender.send(result).unwrap()));
        receiver.recv_timeout(WAIT).unwrap()
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn properties(key: &str, value: &str) -> Properties {
        Properties::from([(key.to_owned(), value.into())])
    }

    fn tuning(device: &[(&str, &str)], users: &[(&str, &str, &str)]) -> TuningSnapshot {
        let mut snapshot = TuningSnapshot {
            device: device
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            users: HashMap::new(),
        };
        for (user, k, v) in users {
            snapshot
                .users
                .entry(user.to_string())
                .or_default()
                .insert(k.to_string(), v.to_string());
        }
        snapshot
    }

    fn ready_session(backend: &Arc<MockBackend>, user: &str) -> Session {
        let session = setup(backend);
        let params = InitParams {
            user: EntityInfo::user(user),
            ..InitParams::new("acme")
        };
        assert_eq!(wait_for(|cb| session.init(params, cb)), Ok(()));
        session
    }

    #[test]
    fn init_with_user() {
        let backend = Arc::new(MockBackend::default());
        let session = setup(&backend);

        let params = InitParams {
            user: EntityInfo::user("u1"),
            request_timeout: Duration::from_secs(30),
            ..InitParams::new("acme")
        };
        let (sender, receiver) = mpsc::channel();
        session.init(params, move |result| sender.send(result).unwrap());

        assert_eq!(receiver.recv_timeout(WAIT), Ok(Ok(())));
        assert!(session.is_ready());
        assert_eq!(session.set_active_user("u1"), Ok(()));
        assert_eq!(session.user_id(), "u1");

        let device_id = session.device_id();
        assert_eq!(device_id.len(), 32);
        assert_eq!(
            *backend.init_calls.lock().unwrap(),
            vec![(Some("u1".to_owned()), device_id)]
        );

        session.shutdown().unwrap();
        // Exactly once.
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn init_keeps_device_id_override() {
        let backend = Arc::new(MockBackend::default());
        let session = setup(&backend);

        let params = InitParams {
            device: EntityInfo::device().override_id("device-42"),
            ..InitParams::new("acme")
        };
        assert_eq!(wait_for(|cb| session.init(params, cb)), Ok(()));

        assert_eq!(session.device_id(), "device-42");
        assert_eq!(session.user_id(), "");
    }

    #[test]
    fn operations_before_init_fail() {
        let backend = Arc::new(MockBackend::default());
        let session = setup(&backend);

        assert_eq!(
            wait_for(|cb| session.refresh_tuning(cb)),
            Err(Error::NotInitialized)
        );
        assert_eq!(
            wait_for(|cb| session.register_user(EntityInfo::user("u1"), cb)),
            Err(Error::NotInitialized)
        );
        assert_eq!(session.set_active_user("u1"), Err(Error::NotInitialized));
        assert_eq!(session.clear_active_user(), Err(Error::NotInitialized));
        assert_eq!(session.get_var("speed", "slow"), "slow");
        assert_eq!(session.user_id(), "");
        assert_eq!(session.device_id(), "");

        session.update_device_state(properties("a", "b"));
        assert!(session.shared.events.is_empty());
        assert!(backend.registered.lock().unwrap().is_empty());
    }

    #[test]
    fn second_init_is_already_active() {
        let backend = Arc::new(MockBackend::default());
        let session = ready_session(&backend, "u1");

        assert_eq!(
            wait_for(|cb| session.init(InitParams::new("acme"), cb)),
            Err(Error::AlreadyActive)
        );
        assert_eq!(backend.init_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_init_can_be_retried() {
        let backend = Arc::new(MockBackend::default());
        *backend.init_error.lock().unwrap() = Some(Error::NetworkError);
        let session = setup(&backend);

        assert_eq!(
            wait_for(|cb| session.init(InitParams::new("acme"), cb)),
            Err(Error::NetworkError)
        );
        assert!(!session.is_ready());
        assert_eq!(session.device_id(), "");

        *backend.init_error.lock().unwrap() = None;
        assert_eq!(
            wait_for(|cb| session.init(InitParams::new("acme"), cb)),
            Ok(())
        );
        assert!(session.is_ready());
    }

    #[test]
    fn invalid_params_fail_without_backend_call() {
        let backend = Arc::new(MockBackend::default());
        let session = setup(&backend);

        assert_eq!(
            wait_for(|cb| session.init(InitParams::new(""), cb)),
            Err(Error::InvalidArgument)
        );
        assert!(backend.init_calls.lock().unwrap().is_empty());
        assert!(!session.is_ready());
    }

    #[test]
    fn tuning_failure_during_init_is_not_fatal() {
        let backend = Arc::new(MockBackend::default());
        *backend.tuning_error.lock().unwrap() = Some(Error::Timeout);
        let session = ready_session(&backend, "");

        assert_eq!(session.get_var("speed", "slow"), "slow");
    }

    #[test]
    fn refresh_failure_keeps_cached_values() {
        let backend = Arc::new(MockBackend::default());
        *backend.tuning.lock().unwrap() = tuning(&[("speed", "fast")], &[]);
        let session = ready_session(&backend, "");
        assert_eq!(session.get_var("speed", "slow"), "fast");

        *backend.tuning_error.lock().unwrap() = Some(Error::NetworkError);
        *backend.tuning.lock().unwrap() = tuning(&[("speed", "faster")], &[]);
        assert_eq!(
            wait_for(|cb| session.refresh_tuning(cb)),
            Err(Error::NetworkError)
        );
        assert_eq!(session.get_var("speed", "slow"), "fast");

        *backend.tuning_error.lock().unwrap() = None;
        assert_eq!(wait_for(|cb| session.refresh_tuning(cb)), Ok(()));
        assert_eq!(session.get_var("speed", "slow"), "faster");
        assert_eq!(session.get_var_as("missing", 3), 3);
    }

    #[test]
    fn registered_user_gets_user_tuning() {
        let backend = Arc::new(MockBackend::default());
        *backend.tuning.lock().unwrap() =
            tuning(&[("speed", "fast"), ("lives", "3")], &[("u2", "speed", "turbo")]);
        let session = ready_session(&backend, "");

        assert_eq!(
            wait_for(|cb| session.register_user(EntityInfo::user("u2"), cb)),
            Ok(())
        );
        assert_eq!(*backend.registered.lock().unwrap(), vec!["u2".to_owned()]);
        assert_eq!(session.user_id(), "u2");
        assert_eq!(session.get_var("speed", "slow"), "turbo");
        assert_eq!(session.get_var_as("lives", 1), 3);

        session.clear_active_user().unwrap();
        assert_eq!(session.user_id(), "");
        assert_eq!(session.get_var("speed", "slow"), "fast");
    }

    #[test]
    fn register_user_requires_an_id() {
        let backend = Arc::new(MockBackend::default());
        let session = ready_session(&backend, "");

        assert_eq!(
            wait_for(|cb| session.register_user(EntityInfo::user(""), cb)),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            wait_for(|cb| session.register_user(EntityInfo::device(), cb)),
            Err(Error::InvalidArgument)
        );
        assert!(backend.registered.lock().unwrap().is_empty());
    }

    #[test]
    fn set_active_user_rejects_empty_id() {
        let backend = Arc::new(MockBackend::default());
        let session = ready_session(&backend, "u1");

        assert_eq!(session.set_active_user(""), Err(Error::InvalidArgument));
        assert_eq!(session.user_id(), "u1");
    }

    #[test]
    fn resume_flushes_events_in_order() {
        let backend = Arc::new(MockBackend::default());
        let session = ready_session(&backend, "u1");

        session.pause();
        session.update_device_state(properties("os", "linux"));
        session.update_user_state(properties("tier", "gold"));
        session.update_collection("coins", 10.0, 5.0, true);
        session.flush();
        std::thread::sleep(Duration::from_millis(100));
        assert!(backend.sent.lock().unwrap().is_empty());
        assert_eq!(session.shared.events.len(), 3);

        session.resume();
        wait_until(|| backend.sent.lock().unwrap().len() == 3);

        let sent = backend.sent.lock().unwrap();
        assert!(matches!(sent[0].payload, EventPayload::DeviceState(_)));
        assert!(matches!(sent[1].payload, EventPayload::UserState(_)));
        assert!(matches!(sent[2].payload, EventPayload::Collection(_)));
        assert!(sent.iter().all(|it| it.user_id.as_deref() == Some("u1")));
    }

    #[test]
    fn user_state_without_active_user_is_ignored() {
        let backend = Arc::new(MockBackend::default());
        let session = ready_session(&backend, "");

        session.update_user_state(properties("tier", "gold"));

        assert!(session.shared.events.is_empty());
    }

    #[test]
    fn failed_delivery_keeps_events() {
        let backend = Arc::new(MockBackend::default());
        *backend.send_error.lock().unwrap() = Some(Error::NetworkError);
        let session = ready_session(&backend, "");

        session.update_device_state(properties("os", "linux"));
        session.flush();
        wait_until(|| session.shared.events.flush_period() > Duration::from_secs(5));
        assert_eq!(session.shared.events.len(), 1);

        *backend.send_error.lock().unwrap() = None;
        session.flush();
        wait_until(|| backend.sent.lock().unwrap().len() == 1);
        assert!(session.shared.events.is_empty());
    }

    #[test]
    fn ended_transaction_is_delivered() {
        let backend = Arc::new(MockBackend::default());
        let session = ready_session(&backend, "");
        let key = TransactionKey::new("tutorial", None);

        session
            .begin_transaction(
                key.clone(),
                properties("step", "intro"),
                Duration::ZERO,
                TimeoutMode::Transaction,
            )
            .unwrap();
        session
            .update_transaction(&key, Properties::new(), 50)
            .unwrap();
        session.end_transaction(&key, Properties::new(), TXN_SUCCESS);
        // Already ended; ignored.
        session.end_transaction(&key, Properties::new(), TXN_SUCCESS);
        session.flush();

        wait_until(|| !backend.sent.lock().unwrap().is_empty());
        let sent = backend.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let EventPayload::Transaction(record) = &sent[0].payload else {
            panic!("expected a transaction event");
        };
        assert_eq!(record.category, "tutorial");
        assert_eq!(record.result, TXN_SUCCESS);
        assert_eq!(record.progress_history, vec![50]);
    }

    #[test]
    fn transaction_times_out() {
        init_logger();
        let backend = Arc::new(MockBackend::default());
        let session = Session::with_backend(backend.clone()).unwrap();
        let (sender, receiver) = mpsc::channel::<TransactionRecord>();
        let sender = Mutex::new(sender);
        let params = InitParams {
            timeout_listener: Some(Arc::new(move |record: &TransactionRecord| {
                sender.lock().unwrap().send(record.clone()).unwrap();
            })),
            ..InitParams::new("acme")
        };
        assert_eq!(wait_for(|cb| session.init(params, cb)), Ok(()));

        let key = TransactionKey::new("purchase", Some("t1"));
        session
            .begin_transaction(
                key.clone(),
                Properties::new(),
                Duration::from_millis(200),
                TimeoutMode::Transaction,
            )
            .unwrap();

        let record = receiver.recv_timeout(WAIT).unwrap();
        assert_eq!(record.category, "purchase");
        assert_eq!(record.transaction_id.as_deref(), Some("t1"));
        assert_eq!(record.result, TXN_TIMEOUT);
        assert!(record.timed_out);
        assert!(!session.shared.transactions.is_active(&key));

        // Ending a timed-out transaction is absorbed.
        session.end_transaction(&key, Properties::new(), TXN_SUCCESS);
        assert_eq!(session.shared.events.len(), 1);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn begin_and_update_report_misuse() {
        let backend = Arc::new(MockBackend::default());
        let session = setup(&backend);
        let key = TransactionKey::new("level", Some("1"));

        assert_eq!(
            session.begin_transaction(
                key.clone(),
                Properties::new(),
                Duration::ZERO,
                TimeoutMode::Transaction
            ),
            Err(Error::NotInitialized)
        );
        assert_eq!(
            session.update_transaction(&key, Properties::new(), 10),
            Err(Error::NotInitialized)
        );

        assert_eq!(wait_for(|cb| session.init(InitParams::new("acme"), cb)), Ok(()));
        assert_eq!(
            session.update_transaction(&key, Properties::new(), 10),
            Err(Error::NotActive)
        );
        session
            .begin_transaction(
                key.clone(),
                properties("difficulty", "hard"),
                Duration::ZERO,
                TimeoutMode::Transaction,
            )
            .unwrap();
        assert_eq!(
            session.begin_transaction(
                key.clone(),
                properties("difficulty", "easy"),
                Duration::ZERO,
                TimeoutMode::Transaction
            ),
            Err(Error::AlreadyActive)
        );

        // The rejected begin left the active transaction alone.
        session.pause();
        session.end_transaction(&key, Properties::new(), TXN_SUCCESS);
        let batch = {
            session.shared.events.resume();
            session.shared.events.next_batch()
        };
        let EventPayload::Transaction(record) = &batch[0].payload else {
            panic!("expected a transaction event");
        };
        assert_eq!(record.properties["difficulty"], "hard");
    }

    #[test]
    fn idle_category_times_out_together() {
        init_logger();
        let backend = Arc::new(MockBackend::default());
        let session = Session::with_backend(backend.clone()).unwrap();
        let (sender, receiver) = mpsc::channel::<TransactionRecord>();
        let sender = Mutex::new(sender);
        let params = InitParams {
            timeout_listener: Some(Arc::new(move |record: &TransactionRecord| {
                sender.lock().unwrap().send(record.clone()).unwrap();
            })),
            ..InitParams::new("acme")
        };
        assert_eq!(wait_for(|cb| session.init(params, cb)), Ok(()));

        let idle = TransactionKey::new("level", Some("a"));
        let busy = TransactionKey::new("level", Some("b"));
        let began = Instant::now();
        for key in [&idle, &busy] {
            session
                .begin_transaction(
                    key.clone(),
                    Properties::new(),
                    Duration::from_millis(200),
                    TimeoutMode::Any,
                )
                .unwrap();
        }

        // Activity on any transaction of the category keeps both alive.
        let mut last_update = began;
        for progress in [20, 40, 60, 80, 100] {
            std::thread::sleep(Duration::from_millis(60));
            last_update = Instant::now();
            session
                .update_transaction(&busy, Properties::new(), progress)
                .unwrap();
        }
        assert!(receiver.try_recv().is_err());
        assert!(session.shared.transactions.is_active(&idle));

        let mut timed_out = vec![
            receiver.recv_timeout(WAIT).unwrap(),
            receiver.recv_timeout(WAIT).unwrap(),
        ];
        assert!(last_update.duration_since(began) >= Duration::from_millis(300));
        assert!(last_update.elapsed() >= Duration::from_millis(200));

        timed_out.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        assert_eq!(timed_out[0].transaction_id.as_deref(), Some("a"));
        assert_eq!(timed_out[1].transaction_id.as_deref(), Some("b"));
        assert!(timed_out
            .iter()
            .all(|record| record.timed_out && record.timeout_mode == TimeoutMode::Any));
        assert_eq!(timed_out[1].progress_history, vec![20, 40, 60, 80, 100]);
        assert_eq!(
            session.update_transaction(&busy, Properties::new(), 100),
            Err(Error::NotActive)
        );
    }

    #[test]
    fn undelivered_events_survive_restart() {
        let storage = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::default());
        let params = || InitParams {
            storage_path: Some(storage.path().to_owned()),
            ..InitParams::new("acme")
        };

        let session = setup(&backend);
        assert_eq!(wait_for(|cb| session.init(params(), cb)), Ok(()));
        let device_id = session.device_id();
        session.pause();
        session.update_collection("coins", 10.0, 5.0, true);
        session.update_collection("gems", 2.0, -1.0, true);
        session.shutdown().unwrap();
        assert!(backend.sent.lock().unwrap().is_empty());

        let session = setup(&backend);
        assert_eq!(wait_for(|cb| session.init(params(), cb)), Ok(()));
        assert_eq!(session.device_id(), device_id);
        assert_eq!(backend.init_calls.lock().unwrap()[1].1, device_id);
        assert_eq!(session.shared.events.len(), 2);

        session.flush();
        wait_until(|| backend.sent.lock().unwrap().len() == 2);
        session.shutdown().unwrap();

        let sent = backend.sent.lock().unwrap();
        let names: Vec<_> = sent
            .iter()
            .map(|event| match &event.payload {
                EventPayload::Collection(collection) => collection.name.as_str(),
                _ => panic!("expected a collection event"),
            })
            .collect();
        assert_eq!(names, vec!["coins", "gems"]);
        assert!(sent.iter().all(|event| event.device_id == device_id));
    }

    #[test]
    fn restored_events_are_not_saved_twice() {
        let storage = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::default());
        let params = || InitParams {
            storage_path: Some(storage.path().to_owned()),
            ..InitParams::new("acme")
        };

        let session = setup(&backend);
        assert_eq!(wait_for(|cb| session.init(params(), cb)), Ok(()));
        session.pause();
        session.update_collection("coins", 10.0, 5.0, true);
        session.shutdown().unwrap();

        // Delivered by the second launch, so the third starts empty.
        let session = setup(&backend);
        assert_eq!(wait_for(|cb| session.init(params(), cb)), Ok(()));
        session.flush();
        wait_until(|| backend.sent.lock().unwrap().len() == 1);
        session.shutdown().unwrap();

        let session = setup(&backend);
        assert_eq!(wait_for(|cb| session.init(params(), cb)), Ok(()));
        assert!(session.shared.events.is_empty());
    }

    #[test]
    fn shutdown_delivers_pending_callbacks() {
        let backend = Arc::new(MockBackend::default());
        let session = setup(&backend);

        let (sender, receiver) = mpsc::channel();
        let init_sender = sender.clone();
        session.init(InitParams::new("acme"), move |result| {
            init_sender.send(("init", result)).unwrap()
        });
        session.refresh_tuning(move |result| sender.send(("refresh", result)).unwrap());
        session.shutdown().unwrap();

        let mut results: Vec<_> = receiver.try_iter().collect();
        results.sort_by_key(|(name, _)| *name);
        assert_eq!(
            results,
            vec![("init", Ok(())), ("refresh", Err(Error::NotInitialized))]
        );
    }

    #[test]
    fn notifications_reach_listener() {
        init_logger();
        let backend = Arc::new(MockBackend::default());
        let session = Session::with_backend(backend.clone()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let params = InitParams {
            notification_listener: {
                let received = received.clone();
                Arc::new(move |notification: &Notification| {
                    received.lock().unwrap().push(notification.clone())
                })
            },
            ..InitParams::new("acme")
        };
        assert_eq!(wait_for(|cb| session.init(params, cb)), Ok(()));

        session.notification_received(Some("Daily bonus!".to_owned()), true);

        assert_eq!(
            *received.lock().unwrap(),
            vec![Notification {
                message: Some("Daily bonus!".to_owned()),
                was_launched_by: true,
            }]
        );
    }
}
