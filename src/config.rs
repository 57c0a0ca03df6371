use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use url::Url;

use crate::{
    entity::EntityKind, event::TimeoutListener, notification::NoopNotificationListener,
    EntityInfo, Error, NotificationListener, Result,
};

/// Push notification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Notification service host.
    pub host: String,
    /// Platform resource id of the small notification icon. `0` uses the application icon.
    pub small_icon: i32,
    /// Post notifications even while the application is in the foreground.
    pub always_post: bool,
    /// Keep delivered notifications instead of clearing them when the application opens.
    pub disable_auto_clear: bool,
}

impl NotificationConfig {
    /// Default notification host.
    pub const DEFAULT_HOST: &'static str = "https://notification.splyt.com";
}

impl Default for NotificationConfig {
    fn default() -> NotificationConfig {
        NotificationConfig {
            host: NotificationConfig::DEFAULT_HOST.to_owned(),
            small_icon: 0,
            always_post: false,
            disable_auto_clear: false,
        }
    }
}

/// Parameters for [`Session::init`](crate::Session::init).
///
/// All fields are public; start from [`InitParams::new`] and override what you need:
///
/// ```
/// # use std::time::Duration;
/// # use splyt::{EntityInfo, InitParams};
/// let params = InitParams {
///     user: EntityInfo::user("u1").with_property("tier", "gold"),
///     request_timeout: Duration::from_secs(10),
///     ..InitParams::new("acme-game")
/// };
/// ```
pub struct InitParams {
    /// Splyt customer id.
    pub customer_id: String,
    /// Initial user. A user without an id starts the session without an active user.
    pub user: EntityInfo,
    /// Device info. The device id is generated unless overridden.
    pub device: EntityInfo,
    /// Per-request deadline for backend calls.
    pub request_timeout: Duration,
    /// Data collection host.
    pub host: String,
    /// Log request and response payloads at debug level.
    pub log_enabled: bool,
    /// SDK name reported to the backend.
    pub sdk_name: String,
    /// SDK version reported to the backend. Must be a semantic version.
    pub sdk_version: String,
    /// Push notification settings.
    pub notification: NotificationConfig,
    /// Receives push notifications handed to
    /// [`Session::notification_received`](crate::Session::notification_received).
    pub notification_listener: Arc<dyn NotificationListener + Send + Sync>,
    /// Receives transactions finalized by their timeout.
    pub timeout_listener: Option<Arc<dyn TimeoutListener + Send + Sync>>,
    /// Directory where the device id and undelivered events are kept between launches. Events
    /// are saved when the session is paused or shut down and restored by the next `init`.
    ///
    /// `None` keeps everything in memory, and a new device id is generated on every launch
    /// unless [`InitParams::device`] overrides it.
    pub storage_path: Option<PathBuf>,
}

impl InitParams {
    /// Default data collection host.
    pub const DEFAULT_HOST: &'static str = "https://data.splyt.com";

    /// Default per-request deadline.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create default parameters for the specified customer.
    pub fn new(customer_id: impl Into<String>) -> InitParams {
        InitParams {
            customer_id: customer_id.into(),
            ..InitParams::default()
        }
    }

    /// Check everything that can be checked without talking to the backend.
    pub(crate) fn validate(&self) -> Result<Url> {
        if self.customer_id.trim().is_empty() {
            log::warn!(target: "splyt", "customer id is required");
            return Err(Error::InvalidArgument);
        }
        if self.user.kind() != EntityKind::User {
            log::warn!(target: "splyt", "user info must be created with EntityInfo::user");
            return Err(Error::InvalidArgument);
        }
        if self.device.kind() != EntityKind::Device {
            log::warn!(target: "splyt", "device info must be created with EntityInfo::device");
            return Err(Error::InvalidArgument);
        }
        semver::Version::parse(&self.sdk_version).map_err(|err| {
            log::warn!(target: "splyt", sdk_version = self.sdk_version.as_str(); "invalid sdk version: {err}");
            Error::from(err)
        })?;
        let host = Url::parse(&self.host).map_err(|err| {
            log::warn!(target: "splyt", host = self.host.as_str(); "invalid host: {err}");
            Error::from(err)
        })?;
        Ok(host)
    }
}

impl Default for InitParams {
    fn default() -> InitParams {
        InitParams {
            customer_id: String::new(),
            user: EntityInfo::user(""),
            device: EntityInfo::device(),
            request_timeout: InitParams::DEFAULT_REQUEST_TIMEOUT,
            host: InitParams::DEFAULT_HOST.to_owned(),
            log_enabled: false,
            sdk_name: "rust".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
            notification: NotificationConfig::default(),
            notification_listener: Arc::new(NoopNotificationListener),
            timeout_listener: None,
            storage_path: None,
        }
    }
}

impl fmt::Debug for InitParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitParams")
            .field("customer_id", &self.customer_id)
            .field("user", &self.user)
            .field("device", &self.device)
            .field("request_timeout", &self.request_timeout)
            .field("host", &self.host)
            .field("log_enabled", &self.log_enabled)
            .field("sdk_name", &self.sdk_name)
            .field("sdk_version", &self.sdk_version)
            .field("notification", &self.notification)
            .field("storage_path", &self.storage_path)
            .finish_non_exhaustive()
    }
}
