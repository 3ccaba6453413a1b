//! User-facing notifications for driver and mount outcomes.
//!
//! The helper itself never draws anything. It posts an [`Alert`] to an
//! [`AlertDispatcher`]; the shipped [`LogDispatcher`] writes a structured
//! log record and, unless quiet, a short message on stderr.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::Serialize;

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertTopic {
    /// No driver build exists for this OS release.
    #[serde(rename = "kOSXFUSEOSIsTooNew")]
    OsTooNew,
    /// The OS is older than the driver supports.
    #[serde(rename = "kOSXFUSEOSIsTooOld")]
    OsTooOld,
    /// A stale driver is loaded and would not unload.
    #[serde(rename = "kOSXFUSEVersionMismatch")]
    VersionMismatch,
    /// System policy refused to load the driver.
    #[serde(rename = "kOSXFUSESystemPolicy")]
    PolicyBlocked,
    /// A volume was mounted.
    #[serde(rename = "kOSXFUSEMount")]
    Mounted,
}

impl AlertTopic {
    /// Wire name of the notification.
    pub fn name(self) -> &'static str {
        match self {
            AlertTopic::OsTooNew => "kOSXFUSEOSIsTooNew",
            AlertTopic::OsTooOld => "kOSXFUSEOSIsTooOld",
            AlertTopic::VersionMismatch => "kOSXFUSEVersionMismatch",
            AlertTopic::PolicyBlocked => "kOSXFUSESystemPolicy",
            AlertTopic::Mounted => "kOSXFUSEMount",
        }
    }

    /// Headline and body shown to the user, if the topic is an error.
    pub fn message(self) -> Option<(&'static str, &'static str)> {
        match self {
            AlertTopic::OsTooNew => Some((
                "Unsupported macOS Version",
                "The installed version of FUSE is too old for the operating system. \
                 Please upgrade your FUSE installation to one that is compatible with \
                 the currently running version of macOS.",
            )),
            AlertTopic::OsTooOld => Some((
                "Unsupported macOS Version",
                "The installed version of FUSE is too new for the operating system. \
                 Please downgrade your FUSE installation to one that is compatible with \
                 the currently running version of macOS.",
            )),
            AlertTopic::VersionMismatch => Some((
                "Version Mismatch",
                "FUSE has been updated but an incompatible or old version of the system \
                 extension is already loaded. It failed to unload, possibly because a FUSE \
                 volume is currently mounted. Please eject all FUSE volumes and try again, \
                 or simply restart the system for changes to take effect.",
            )),
            AlertTopic::PolicyBlocked => Some((
                "System Extension Blocked",
                "The system extension required for mounting FUSE volumes could not be \
                 loaded. Please open the Security & Privacy System Preferences pane and \
                 allow loading system software from developer \"Benjamin Fleischer\". \
                 Then try again mounting the volume.",
            )),
            AlertTopic::Mounted => None,
        }
    }
}

/// One notification with its string payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    /// Notification kind.
    pub topic: AlertTopic,
    /// Extra key/value context, such as the mount path.
    pub payload: BTreeMap<String, String>,
}

impl Alert {
    /// Creates an alert with an empty payload.
    pub fn new(topic: AlertTopic) -> Self {
        Self {
            topic,
            payload: BTreeMap::new(),
        }
    }

    /// Adds one payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Sink for alerts.
pub trait AlertDispatcher {
    /// Delivers one alert. Delivery failures are not reported back.
    fn post(&self, alert: &Alert);
}

/// Posts alerts to the log, and to stderr unless quiet.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher {
    /// Skip the stderr message.
    pub quiet: bool,
}

impl LogDispatcher {
    /// Creates a dispatcher; `quiet` comes from `-q`.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl AlertDispatcher for LogDispatcher {
    fn post(&self, alert: &Alert) {
        let record = serde_json::to_string(alert).unwrap_or_else(|_| alert.topic.name().to_string());
        match alert.topic.message() {
            Some((title, body)) => {
                warn!("alert {}", record);
                if !self.quiet {
                    eprintln!("{}: {}", title, body);
                }
            }
            None => info!("notification {}", record),
        }
    }
}
