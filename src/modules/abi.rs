//! Mount descriptor passed to the driver as the `data` argument of `mount(2)`.
//!
//! The layout must match the driver's `struct fuse_mount_args` exactly, so
//! the struct is `#[repr(C)]` and every string lives in a fixed-size,
//! NUL-terminated byte array.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::constants::*;
use super::options::MountOptions;

/// The driver's mount arguments, field for field.
#[repr(C)]
#[derive(Clone)]
pub struct MountDescriptor {
    /// Canonical mount point.
    pub mntpath: [u8; MAXPATHLEN],
    /// Name shown as the mount source.
    pub fsname: [u8; MAXPATHLEN],
    /// Type name suffix from `fstypename=`.
    pub fstypename: [u8; MFSTYPENAMELEN],
    /// Finder volume name.
    pub volname: [u8; MAXPATHLEN],
    /// Validated driver flags.
    pub altflags: u64,
    /// Block size in bytes.
    pub blocksize: u32,
    /// Seconds before an unresponsive daemon is abandoned.
    pub daemon_timeout: u32,
    /// Resolved personality subtype.
    pub fssubtype: u32,
    /// Explicit file system id, 0 when unset.
    pub fsid: u32,
    /// Maximum I/O size in bytes.
    pub iosize: u32,
    /// Session token read from the device.
    pub random: u32,
    /// Device number of the negotiated device.
    pub rdev: i32,
}

impl std::fmt::Debug for MountDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountDescriptor")
            .field("mntpath", &field_str(&self.mntpath))
            .field("fsname", &field_str(&self.fsname))
            .field("fstypename", &field_str(&self.fstypename))
            .field("volname", &field_str(&self.volname))
            .field("altflags", &format_args!("{:#x}", self.altflags))
            .field("blocksize", &self.blocksize)
            .field("daemon_timeout", &self.daemon_timeout)
            .field("fssubtype", &self.fssubtype)
            .field("fsid", &self.fsid)
            .field("iosize", &self.iosize)
            .field("rdev", &self.rdev)
            .finish()
    }
}

/// Device facts the descriptor needs from the negotiated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Slot `N` of `/dev/osxfuse<N>`.
    pub index: u32,
    /// Session token.
    pub token: u32,
    /// Device number.
    pub rdev: u64,
}

impl MountDescriptor {
    /// Composes the descriptor for one mount.
    ///
    /// # Arguments
    ///
    /// * `mount_point` - canonical mount point path
    /// * `options` - validated options with resolved values
    /// * `device` - index, session token and device number of the open channel
    /// * `daemon_name` - basename of the daemon binary, used in default names
    pub fn compose(
        mount_point: &Path,
        options: &MountOptions,
        device: DeviceIdentity,
        daemon_name: Option<&str>,
    ) -> Self {
        let values = &options.values;
        let fsname = values
            .fsname
            .clone()
            .unwrap_or_else(|| default_fsname(device.index, daemon_name));
        let volname = values
            .volname
            .clone()
            .unwrap_or_else(|| default_volname(device.index, daemon_name));
        let fstypename = values.fstypename.as_deref().unwrap_or("");

        let mut descriptor = Self {
            mntpath: [0; MAXPATHLEN],
            fsname: [0; MAXPATHLEN],
            fstypename: [0; MFSTYPENAMELEN],
            volname: [0; MAXPATHLEN],
            altflags: options.altflags.bits(),
            blocksize: values.blocksize,
            daemon_timeout: values.daemon_timeout,
            fssubtype: values.fssubtype,
            fsid: values.fsid,
            iosize: values.iosize,
            random: device.token,
            // dev_t is 32 bits wide on the driver side.
            rdev: device.rdev as i32,
        };
        copy_bounded(&mut descriptor.mntpath, mount_point.as_os_str().as_bytes());
        copy_bounded(&mut descriptor.fsname, fsname.as_bytes());
        copy_bounded(&mut descriptor.fstypename, fstypename.as_bytes());
        copy_bounded(&mut descriptor.volname, volname.as_bytes());
        descriptor
    }
}

/// Mount source name used when `fsname=` is absent.
pub fn default_fsname(index: u32, daemon_name: Option<&str>) -> String {
    format!(
        "{}@{}{}",
        daemon_name.unwrap_or("instance"),
        DEVICE_BASENAME,
        index
    )
}

/// Volume name used when `volname=` is absent.
pub fn default_volname(index: u32, daemon_name: Option<&str>) -> String {
    match daemon_name {
        Some(daemon) => format!("{} Volume {} ({})", DISPLAY_NAME, index, daemon),
        None => format!("{} Volume {}", DISPLAY_NAME, index),
    }
}

/// Copies `src` into `dst`, truncating so the last byte is always NUL.
pub fn copy_bounded(dst: &mut [u8], src: &[u8]) {
    if dst.is_empty() {
        return;
    }
    let len = src.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(0);
}

/// Text up to the first NUL.
pub fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
