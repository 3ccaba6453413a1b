//! Error taxonomy shared by the mount pipeline and the driver loader.

use std::io;
use thiserror::Error;

/// sysexits(3) codes used as the process exit status.
pub mod exit {
    /// Mounted.
    pub const OK: u8 = 0;
    /// `EX_USAGE`
    pub const USAGE: u8 = 64;
    /// `EX_UNAVAILABLE`
    pub const UNAVAILABLE: u8 = 69;
    /// `EX_OSERR`
    pub const OSERR: u8 = 71;
    /// `EX_OSFILE`
    pub const OSFILE: u8 = 72;
}

/// Terminal failure of a mount attempt.
#[derive(Debug, Error)]
pub enum MountError {
    /// Bad or conflicting arguments. Nothing was mounted.
    #[error("{0}")]
    Usage(String),
    /// The driver is absent, the wrong version, or blocked by policy.
    #[error("{0}")]
    Unavailable(String),
    /// No free device slot, or the device could not be opened.
    #[error("{0}")]
    Resource(String),
    /// A mount, ioctl, fork or descriptor-passing call failed.
    #[error("{context}: {source}")]
    Os {
        /// What was being attempted.
        context: String,
        /// The underlying system error.
        #[source]
        source: io::Error,
    },
    /// The mount point could not be inspected.
    #[error("{0}")]
    File(String),
}

impl MountError {
    /// Shorthand for [`MountError::Usage`].
    pub fn usage(msg: impl Into<String>) -> Self {
        MountError::Usage(msg.into())
    }

    /// Shorthand for [`MountError::Unavailable`].
    pub fn unavailable(msg: impl Into<String>) -> Self {
        MountError::Unavailable(msg.into())
    }

    /// Wraps a system error with the step that failed.
    pub fn os(context: impl Into<String>, source: io::Error) -> Self {
        MountError::Os {
            context: context.into(),
            source,
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MountError::Usage(_) => exit::USAGE,
            MountError::Unavailable(_) => exit::UNAVAILABLE,
            MountError::Resource(_) | MountError::Os { .. } => exit::OSERR,
            MountError::File(_) => exit::OSFILE,
        }
    }
}

/// Failure of a driver lifecycle operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The running kernel is older than the oldest supported release.
    #[error("the operating system is too old for this driver")]
    OsTooOld,
    /// No driver build exists for the running operating system.
    #[error("no driver found for this operating system")]
    NotFound,
    /// System policy refused to load the driver.
    #[error("loading the driver was blocked by system policy")]
    PolicyBlocked,
    /// The loaded driver refused to unload.
    #[error("the loaded driver could not be unloaded")]
    Busy,
    /// Any other facility failure.
    #[error("{0}")]
    Other(String),
}

/// The version descriptor could not be read.
#[derive(Debug, Error)]
#[error("cannot read system version from {path}: {reason}")]
pub struct ReadError {
    /// Descriptor that was read.
    pub path: String,
    /// Why it could not be used.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MountError::usage("x").exit_code(), exit::USAGE);
        assert_eq!(MountError::unavailable("x").exit_code(), exit::UNAVAILABLE);
        assert_eq!(MountError::Resource("x".into()).exit_code(), exit::OSERR);
        assert_eq!(
            MountError::os("mount", io::Error::from_raw_os_error(libc::EPERM)).exit_code(),
            exit::OSERR
        );
        assert_eq!(MountError::File("x".into()).exit_code(), exit::OSFILE);
    }

    #[test]
    fn test_os_error_message_keeps_context() {
        let err = MountError::os(
            "failed to mount /tmp/x@/dev/osxfuse0",
            io::Error::from_raw_os_error(libc::EBUSY),
        );
        assert!(err.to_string().starts_with("failed to mount /tmp/x@/dev/osxfuse0: "));
    }
}
