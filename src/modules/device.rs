//! Acquires an exclusive driver device and negotiates a session token.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::channel::KernelChannel;
use super::config::{LaunchEnv, ENV_DEV_FD};
use super::constants::{DEVICE_BASENAME, DEVICE_DIR, NDEVICES};
use super::error::MountError;
use super::session::DeviceSession;

/// Where the device descriptor comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSource {
    /// Descriptor inherited from the caller.
    Fd(RawFd),
    /// Explicit device node.
    Named(PathBuf),
    /// First free `/dev/osxfuse<N>`.
    Probe,
}

impl DeviceSource {
    /// Picks the source from the launch environment.
    ///
    /// An inherited descriptor wins over a named device; with neither the
    /// device slots are probed.
    pub fn from_env(env: &LaunchEnv) -> Self {
        match (env.dev_fd, &env.dev_name) {
            (Some(fd), _) => DeviceSource::Fd(fd),
            (None, Some(name)) => DeviceSource::Named(name.clone()),
            (None, None) => DeviceSource::Probe,
        }
    }
}

/// Claims a device through a [`KernelChannel`].
pub struct DeviceNegotiator<'a> {
    channel: &'a dyn KernelChannel,
    dev_dir: PathBuf,
}

impl<'a> DeviceNegotiator<'a> {
    /// Creates a negotiator probing the default device directory.
    pub fn new(channel: &'a dyn KernelChannel) -> Self {
        Self {
            channel,
            dev_dir: PathBuf::from(DEVICE_DIR),
        }
    }

    /// Probes device nodes under `dev_dir` instead.
    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    /// Path of device `index` under the device directory.
    pub fn device_path(&self, index: u32) -> PathBuf {
        self.dev_dir.join(format!("{}{}", DEVICE_BASENAME, index))
    }

    /// Opens a device from `source` and negotiates the session token.
    ///
    /// The returned session marks the device dead when dropped unless it
    /// is finalized. Failures after the device is open take the same path.
    pub fn acquire(&self, source: &DeviceSource) -> Result<DeviceSession<'a>, MountError> {
        let (file, probed_index) = match source {
            DeviceSource::Fd(fd) => {
                let file = self.channel.adopt_fd(*fd).map_err(|e| {
                    MountError::usage(format!("invalid value given in {}: {}", ENV_DEV_FD, e))
                })?;
                (file, None)
            }
            DeviceSource::Named(path) => {
                let file = self.channel.open_device(path).map_err(|e| {
                    MountError::Resource(format!("failed to open device {}: {}", path.display(), e))
                })?;
                (file, None)
            }
            DeviceSource::Probe => {
                let (file, index) = self.probe()?;
                (file, Some(index))
            }
        };

        let mut session = DeviceSession::open(self.channel, file);
        session.rdev = self
            .channel
            .device_number(session.fd())
            .map_err(|e| MountError::os("failed to stat device", e))?;
        session.index = match probed_index {
            Some(index) => index,
            None => self.recover_index(session.rdev)?,
        };

        let device = self.device_path(session.index);
        session.token = self.channel.session_token(session.fd()).map_err(|e| {
            debug!("Token ioctl on {} failed: {}", device.display(), e);
            MountError::unavailable(format!("failed to negotiate with {}", device.display()))
        })?;
        info!("Negotiated session on {}", device.display());
        Ok(session)
    }

    fn probe(&self) -> Result<(std::fs::File, u32), MountError> {
        for index in 0..NDEVICES {
            let path = self.device_path(index);
            match self.channel.open_device(&path) {
                Ok(file) => {
                    debug!("Opened {}", path.display());
                    return Ok((file, index));
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        Err(MountError::Resource("failed to open device".to_string()))
    }

    fn recover_index(&self, rdev: u64) -> Result<u32, MountError> {
        let name = self
            .channel
            .device_name(rdev)
            .ok_or_else(|| MountError::usage("mounting inappropriate device"))?;
        parse_device_index(&name)
    }
}

/// Index `N` of a device named `osxfuse<N>`.
pub fn parse_device_index(name: &str) -> Result<u32, MountError> {
    let name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    let digits = name
        .strip_prefix(DEVICE_BASENAME)
        .ok_or_else(|| MountError::usage("mounting inappropriate device"))?;
    match digits.parse::<u32>() {
        Ok(index) if index < NDEVICES => Ok(index),
        _ => Err(MountError::usage("invalid mount device")),
    }
}
