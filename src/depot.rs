//! On-disk state that survives application restarts: the device id and events that were not
//! delivered before the session was paused or shut down.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{event::Event, Result};

const STATE_FILENAME: &str = "splyt_state.json";
const STATE_VERSION: u16 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DepotState {
    pub version: u16,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A state file inside the storage directory configured in
/// [`InitParams::storage_path`](crate::InitParams::storage_path).
#[derive(Debug)]
pub(crate) struct Depot {
    path: PathBuf,
}

impl Depot {
    pub fn new(dir: &Path) -> Depot {
        Depot {
            path: dir.join(STATE_FILENAME),
        }
    }

    /// Read the saved state. `None` if nothing was saved yet or the file has an unknown version.
    pub fn load(&self) -> Result<Option<DepotState>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: DepotState = serde_json::from_str(&content)?;
        if state.version != STATE_VERSION {
            log::warn!(target: "splyt", version = state.version; "ignoring saved state with unknown version");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Replace the saved state.
    pub fn save(&self, device_id: &str, events: Vec<Event>) -> Result<()> {
        let state = DepotState {
            version: STATE_VERSION,
            device_id: (!device_id.is_empty()).then(|| device_id.to_owned()),
            events,
        };
        let content = serde_json::to_string(&state)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write next to the target and rename, so a crash never leaves a truncated file behind.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Depot, STATE_FILENAME};
    use crate::event::{CollectionUpdate, Event};

    fn event(name: &str) -> Event {
        Event {
            timestamp: Utc::now(),
            user_id: Some("u1".to_owned()),
            device_id: "d1".to_owned(),
            payload: CollectionUpdate {
                name: name.to_owned(),
                balance: 3.0,
                balance_delta: 1.0,
                is_currency: true,
            }
            .into(),
        }
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let depot = Depot::new(dir.path());

        assert_eq!(depot.load(), Ok(None));
    }

    #[test]
    fn saved_state_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![event("gems"), event("coins")];

        Depot::new(dir.path()).save("d1", events.clone()).unwrap();
        let state = Depot::new(dir.path()).load().unwrap().unwrap();

        assert_eq!(state.device_id.as_deref(), Some("d1"));
        assert_eq!(state.events, events);
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        Depot::new(&nested).save("d1", Vec::new()).unwrap();

        assert!(nested.join(STATE_FILENAME).exists());
    }

    #[test]
    fn unknown_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STATE_FILENAME),
            r#"{"version": 99, "deviceId": "d1", "events": []}"#,
        )
        .unwrap();

        assert_eq!(Depot::new(dir.path()).load(), Ok(None));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILENAME), "{not json").unwrap();

        assert_eq!(Depot::new(dir.path()).load(), Err(crate::Error::Unknown));
    }
}
