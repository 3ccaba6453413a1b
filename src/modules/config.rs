//! Launch environment captured once at startup.
//!
//! The FUSE library configures the helper through environment variables
//! rather than arguments. They are read here into a plain struct so the
//! rest of the pipeline never touches the process environment.

use std::env;
use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use super::error::MountError;

/// Present when the FUSE library launched the helper.
pub const ENV_CALL_BY_LIB: &str = "MOUNT_OSXFUSE_CALL_BY_LIB";
/// Socket that receives the device descriptor.
pub const ENV_COMMFD: &str = "_FUSE_COMMFD";
/// Already-open device descriptor to use instead of probing.
pub const ENV_DEV_FD: &str = "FUSE_DEV_FD";
/// Device node to open instead of probing.
pub const ENV_DEV_NAME: &str = "FUSE_DEV_NAME";
/// Path of the daemon binary, used for default names.
pub const ENV_DAEMON_PATH: &str = "MOUNT_OSXFUSE_DAEMON_PATH";
/// Enables the driver's MacFUSE compatibility mode.
pub const ENV_MACFUSE_MODE: &str = "OSXFUSE_MACFUSE_MODE";

/// Environment-provided settings for one mount attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    /// Set when the FUSE library invoked us; suppresses the help banner.
    pub called_by_lib: bool,
    /// Peer socket that receives the device descriptor.
    pub comm_fd: Option<RawFd>,
    /// Already-open device descriptor supplied by the caller.
    pub dev_fd: Option<RawFd>,
    /// Device node to open instead of probing.
    pub dev_name: Option<PathBuf>,
    /// Path of the file system daemon binary.
    pub daemon_path: Option<PathBuf>,
    /// Legacy compatibility mode requested.
    pub macfuse_mode: bool,
}

impl LaunchEnv {
    /// Reads the launch environment of the current process.
    pub fn from_env() -> Result<Self, MountError> {
        Self::from_lookup(|key| env::var_os(key))
    }

    /// Builds the launch environment from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MountError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let comm_fd = match lookup(ENV_COMMFD) {
            Some(value) => Some(parse_fd(&value).ok_or_else(|| MountError::usage("invalid commfd"))?),
            None => None,
        };
        let dev_fd = match lookup(ENV_DEV_FD) {
            Some(value) => Some(
                parse_fd(&value)
                    .ok_or_else(|| MountError::usage(format!("invalid value given in {}", ENV_DEV_FD)))?,
            ),
            None => None,
        };

        Ok(Self {
            called_by_lib: lookup(ENV_CALL_BY_LIB).is_some(),
            comm_fd,
            dev_fd,
            dev_name: lookup(ENV_DEV_NAME).map(PathBuf::from),
            daemon_path: lookup(ENV_DAEMON_PATH).map(PathBuf::from),
            macfuse_mode: lookup(ENV_MACFUSE_MODE).map_or(false, |v| v == "1"),
        })
    }

    /// Basename of the daemon binary, if known.
    pub fn daemon_name(&self) -> Option<String> {
        self.daemon_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
    }
}

fn parse_fd(value: &OsString) -> Option<RawFd> {
    value.to_str()?.trim().parse::<RawFd>().ok().filter(|fd| *fd >= 0)
}
