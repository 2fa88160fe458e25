//! Per-run state shared by all protocol phases.

use crate::error::{Error, Result};
use crate::messages::{NDT_PORT, TEST_C2S, TEST_META, TEST_S2C, TEST_STATUS};
use crate::reactor::Reactor;
use crate::report::Entry;
use crate::transport::{Transport, DEFAULT_TIMEOUT};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// String-keyed configuration for a test run.
///
/// Unknown keys are kept and ignored, so callers can pass through options
/// coming from their own configuration layer without filtering.
///
/// # Examples
///
/// ```
/// use ndt_client::Settings;
///
/// let settings = Settings::new()
///     .with("address", "ndt.example.org")
///     .with("port", 3001);
/// assert_eq!(settings.get("address"), Some("ndt.example.org"));
/// ```
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with<V: ToString>(mut self, key: &str, value: V) -> Self {
        self.set(key, value);
        self
    }

    pub fn set<V: ToString>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    /// Server port, defaulting to the standard NDT port.
    pub fn port(&self) -> Result<u16> {
        match self.get("port") {
            None => Ok(NDT_PORT),
            Some(raw) => raw.parse::<u16>().map_err(|_| Error::InvalidPort),
        }
    }

    /// Requested test suite as an OR of test identifiers. Defaults to the
    /// download plus upload pair.
    pub fn test_suite(&self) -> Result<i32> {
        match self.get("test_suite") {
            None => Ok(TEST_C2S | TEST_S2C),
            Some(raw) => raw
                .parse::<i32>()
                .map_err(|_| Error::InvalidTestId(raw.to_string())),
        }
    }

    /// Tool name used when querying mlab-ns for a nearby server.
    pub fn mlabns_tool_name(&self) -> &str {
        self.get("mlabns_tool_name").unwrap_or("ndt")
    }
}

/// State threaded through the protocol state machine for one run.
pub(crate) struct Context {
    pub reactor: Reactor,
    pub address: String,
    pub port: u16,
    /// Control connection; present from connect until disconnect.
    pub txp: Option<Transport>,
    /// Inbound bytes received but not yet consumed by a read operation.
    pub stash: Rc<RefCell<Vec<u8>>>,
    pub entry: Entry,
    /// Tests we asked for. STATUS and META are always included.
    pub test_suite: i32,
    /// I/O timeout applied to the control connection.
    pub timeout: Duration,
    /// Tests the server granted, in the order it wants to run them.
    pub granted_suite: VecDeque<i32>,
    /// Final-result callback; consumed exactly once at disconnect.
    pub callback: Option<Box<dyn FnOnce(Result<Entry>)>>,
}

pub(crate) type Ctx = Rc<RefCell<Context>>;

impl Context {
    pub fn new(
        reactor: Reactor,
        address: String,
        port: u16,
        requested_suite: i32,
        callback: Box<dyn FnOnce(Result<Entry>)>,
    ) -> Ctx {
        let test_suite = requested_suite | TEST_STATUS | TEST_META;
        Rc::new(RefCell::new(Context {
            reactor,
            address,
            port,
            txp: None,
            stash: Rc::new(RefCell::new(Vec::new())),
            entry: Entry::new(),
            test_suite,
            timeout: DEFAULT_TIMEOUT,
            granted_suite: VecDeque::new(),
            callback: Some(callback),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_ndt_port() {
        assert_eq!(Settings::new().port().unwrap(), NDT_PORT);
        assert_eq!(Settings::new().with("port", 3010).port().unwrap(), 3010);
        assert!(Settings::new().with("port", "nope").port().is_err());
    }

    #[test]
    fn suite_defaults_to_download_and_upload() {
        assert_eq!(Settings::new().test_suite().unwrap(), TEST_C2S | TEST_S2C);
        let only_download = Settings::new().with("test_suite", TEST_S2C);
        assert_eq!(only_download.test_suite().unwrap(), TEST_S2C);
    }

    #[test]
    fn context_always_requests_status_and_meta() {
        let reactor = Reactor::new().unwrap();
        let ctx = Context::new(
            reactor,
            "127.0.0.1".to_string(),
            NDT_PORT,
            TEST_S2C,
            Box::new(|_| {}),
        );
        let suite = ctx.borrow().test_suite;
        assert_eq!(suite, TEST_S2C | TEST_STATUS | TEST_META);
    }
}
