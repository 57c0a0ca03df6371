//! Backend calls made by the session, and an HTTP client implementing them.
use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;

use crate::{event::Event, EntityInfo, Error, Result, SplytError, TuningSnapshot};

/// The backend the session talks to.
///
/// Calls are made from the session's worker thread and are allowed to block up to the request
/// timeout.
pub trait Backend: Send + Sync {
    /// Announce the application start for the device and (optionally) the initial user.
    fn init_application(&self, user: Option<&EntityInfo>, device: &EntityInfo) -> Result<()>;

    /// Register a user.
    fn update_user(&self, user: &EntityInfo, device_id: &str) -> Result<()>;

    /// Fetch tuning variables for the device and the specified users.
    fn fetch_tuning(&self, device_id: &str, user_ids: &[String]) -> Result<TuningSnapshot>;

    /// Deliver a batch of telemetry events.
    fn send_events(&self, events: &[Event]) -> Result<()>;
}

/// Configuration for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Data collection host.
    pub host: Url,
    /// Splyt customer id.
    pub customer_id: String,
    /// SDK name. Usually, language name.
    pub sdk_name: String,
    /// Version of SDK.
    pub sdk_version: String,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Log request and response payloads.
    pub log_enabled: bool,
}

const WS_PATH: &str = "/isos-personalization/ws/interface/";
const WS_VERSION: &str = "4";

const CONTEXT_INIT: &str = "application_init";
const CONTEXT_UPDATE_USER: &str = "application_updateuser";
const CONTEXT_TUNING: &str = "tuner_refresh";
const CONTEXT_EVENTS: &str = "datacollector_batch";

/// A [`Backend`] talking to the Splyt web services over HTTP.
pub struct HttpBackend {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    /// Create a new backend client.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the HTTP client cannot be built with this configuration.
    pub fn new(config: HttpBackendConfig) -> Result<HttpBackend> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(HttpBackend { client, config })
    }

    fn url(&self, context: &str) -> Result<Url> {
        let url = Url::parse_with_params(
            &format!(
                "{}{}{}",
                self.config.host.as_str().trim_end_matches('/'),
                WS_PATH,
                context
            ),
            &[
                ("ssf_ws_version", WS_VERSION),
                ("ssf_cust_id", &*self.config.customer_id),
                ("ssf_output", "json"),
                ("ssf_sdk", &*self.config.sdk_name),
                ("ssf_sdk_version", &*self.config.sdk_version),
                ("ssf_sdk_contextname", context),
            ],
        )?;
        Ok(url)
    }

    fn call(&self, context: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = self.url(context)?;

        log::debug!(target: "splyt", context; "sending request");
        if self.config.log_enabled {
            log::debug!(target: "splyt", context; "request body: {body}");
        }

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .and_then(|it| it.error_for_status())
            .map_err(|err| {
                let err = err.without_url();
                log::warn!(target: "splyt", context; "request failed: {:?}", err);
                Error::from(err)
            })?;

        let envelope: Envelope = response.json().map_err(|err| {
            log::warn!(target: "splyt", context; "failed to parse response body: {:?}", err);
            Error::from(err)
        })?;

        if self.config.log_enabled {
            log::debug!(target: "splyt", context; "response: {envelope:?}");
        }

        envelope.into_context_data(context)
    }
}

impl Backend for HttpBackend {
    fn init_application(&self, user: Option<&EntityInfo>, device: &EntityInfo) -> Result<()> {
        self.call(
            CONTEXT_INIT,
            json!({
                "timestamp": Utc::now(),
                "userId": user.and_then(EntityInfo::id),
                "userProperties": user.map(EntityInfo::properties),
                "deviceId": device.id(),
                "deviceProperties": device.properties(),
            }),
        )?;
        Ok(())
    }

    fn update_user(&self, user: &EntityInfo, device_id: &str) -> Result<()> {
        self.call(
            CONTEXT_UPDATE_USER,
            json!({
                "timestamp": Utc::now(),
                "userId": user.id(),
                "userProperties": user.properties(),
                "deviceId": device_id,
            }),
        )?;
        Ok(())
    }

    fn fetch_tuning(&self, device_id: &str, user_ids: &[String]) -> Result<TuningSnapshot> {
        let data = self.call(
            CONTEXT_TUNING,
            json!({
                "timestamp": Utc::now(),
                "deviceId": device_id,
                "userIds": user_ids,
            }),
        )?;
        let tuning: TuningResponse = serde_json::from_value(data).map_err(|err| {
            log::warn!(target: "splyt", "unexpected tuning response: {err}");
            Error::Unknown
        })?;
        Ok(tuning.into())
    }

    fn send_events(&self, events: &[Event]) -> Result<()> {
        self.call(
            CONTEXT_EVENTS,
            json!({
                "timestamp": Utc::now(),
                "events": events,
            }),
        )?;
        Ok(())
    }
}

/// Top-level response of every web service call.
#[derive(Debug, Deserialize)]
struct Envelope {
    error: i32,
    #[serde(default)]
    data: HashMap<String, ContextResult>,
}

#[derive(Debug, Deserialize)]
struct ContextResult {
    error: i32,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    fn into_context_data(mut self, context: &str) -> Result<serde_json::Value> {
        SplytError::from_code(self.error).into_result().map_err(|err| {
            log::warn!(target: "splyt", context, code = self.error; "top-level error returned from backend");
            err
        })?;

        let Some(result) = self.data.remove(context) else {
            log::warn!(target: "splyt", context; "unexpected response from backend, context missing");
            return Err(Error::Unknown);
        };

        SplytError::from_code(result.error)
            .into_result()
            .map_err(|err| {
                log::warn!(target: "splyt", context, code = result.error; "context error returned from backend");
                err
            })?;

        Ok(result.data)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TuningResponse {
    #[serde(default)]
    device_tuning: HashMap<String, serde_json::Value>,
    #[serde(default)]
    user_tuning: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl From<TuningResponse> for TuningSnapshot {
    fn from(value: TuningResponse) -> TuningSnapshot {
        TuningSnapshot {
            device: stringify_values(value.device_tuning),
            users: value
                .user_tuning
                .into_iter()
                .map(|(user_id, vars)| (user_id, stringify_values(vars)))
                .collect(),
        }
    }
}

/// Tuning values are served as strings; non-string JSON values keep their JSON rendering.
fn stringify_values(vars: HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    vars.into_iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect()
}
