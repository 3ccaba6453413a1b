//! Exclusive ownership of one negotiated driver device.
//!
//! A `DeviceSession` holds the open device for the duration of a mount
//! attempt. If it goes away before [`DeviceSession::finalize`] is called
//! the driver is told the session is dead, so a half-set-up device never
//! lingers.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;

use super::abi::DeviceIdentity;
use super::channel::KernelChannel;

/// One open, negotiated driver device.
pub struct DeviceSession<'a> {
    channel: &'a dyn KernelChannel,
    file: File,
    pub(super) index: u32,
    pub(super) token: u32,
    pub(super) rdev: u64,
    finalized: bool,
}

impl<'a> DeviceSession<'a> {
    /// Takes ownership of `file` and arms the exit hook for it.
    pub(super) fn open(channel: &'a dyn KernelChannel, file: File) -> Self {
        channel.arm_exit_hook(file.as_raw_fd());
        Self {
            channel,
            file,
            index: 0,
            token: 0,
            rdev: 0,
            finalized: false,
        }
    }

    /// Raw descriptor of the device.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Device slot.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Negotiated session token.
    pub fn token(&self) -> u32 {
        self.token
    }

    /// The facts the mount descriptor needs.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            index: self.index,
            token: self.token,
            rdev: self.rdev,
        }
    }

    /// Ends the session successfully. The driver keeps the session alive.
    pub fn finalize(mut self) {
        self.finalized = true;
        self.channel.disarm_exit_hook();
        debug!("Session on device {} finalized", self.index);
    }
}

impl Drop for DeviceSession<'_> {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if self.channel.disarm_exit_hook() {
            if let Err(e) = self.channel.mark_dead(self.fd()) {
                debug!("Failed to mark device {} dead: {}", self.index, e);
            }
        }
    }
}

impl std::fmt::Debug for DeviceSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("fd", &self.fd())
            .field("index", &self.index)
            .field("token", &self.token)
            .field("rdev", &self.rdev)
            .finish()
    }
}
