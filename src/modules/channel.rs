//! OS boundary for the device channel.
//!
//! Everything that touches the driver's character device goes through
//! [`KernelChannel`]: opening it, the session token and mark-dead ioctls,
//! passing the descriptor to the daemon, and the final `mount(2)`.
//! [`OsChannel`] is the real implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IoSlice};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use nix::sys::stat::fstat;

use super::abi::MountDescriptor;
use super::constants::DEVICE_DIR;
use super::options::MntFlags;

/// Driver device and mount operations.
pub trait KernelChannel {
    /// Opens a device node read-write. Fails with `EBUSY` if the slot is taken.
    fn open_device(&self, path: &Path) -> io::Result<File>;
    /// Takes ownership of an already-open device descriptor.
    fn adopt_fd(&self, fd: RawFd) -> io::Result<File>;
    /// `st_rdev` of the open device.
    fn device_number(&self, fd: RawFd) -> io::Result<u64>;
    /// Name of the character device under `/dev` with device number `rdev`.
    fn device_name(&self, rdev: u64) -> Option<String>;
    /// Reads the random session token the driver assigned to this device.
    fn session_token(&self, fd: RawFd) -> io::Result<u32>;
    /// Tells the driver the daemon side of this session is gone.
    fn mark_dead(&self, fd: RawFd) -> io::Result<()>;
    /// Sends `fd` over the unix socket `sock` with one payload byte.
    fn send_fd(&self, sock: RawFd, fd: RawFd) -> io::Result<()>;
    /// Calls `mount(2)` with `descriptor` as the file system specific data.
    ///
    /// # Arguments
    ///
    /// * `fs_type` - registered file system type name
    /// * `path` - canonical mount point
    /// * `flags` - generic mount flags
    /// * `descriptor` - driver mount arguments
    fn mount(
        &self,
        fs_type: &str,
        path: &Path,
        flags: MntFlags,
        descriptor: &MountDescriptor,
    ) -> io::Result<()>;
    /// Arranges for `fd` to be marked dead if the process exits or is signalled.
    fn arm_exit_hook(&self, fd: RawFd);
    /// Cancels the exit hook. Returns whether a descriptor was still armed.
    fn disarm_exit_hook(&self) -> bool;
}

mod ioctls {
    nix::ioctl_write_ptr!(set_daemon_dead, b'F', 3, u32);
    nix::ioctl_read!(get_random, b'F', 5, u32);
}

static ARMED_FD: AtomicI32 = AtomicI32::new(-1);
static HOOKS: Once = Once::new();

/// Marks the armed descriptor dead, at most once. Safe in signal context.
fn fire_exit_hook() {
    let fd = ARMED_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        let dummy: u32 = 0;
        let _ = unsafe { ioctls::set_daemon_dead(fd, &dummy) };
    }
}

extern "C" fn exit_hook() {
    fire_exit_hook();
}

fn register_exit_hooks() {
    if unsafe { libc::atexit(exit_hook) } != 0 {
        warn!("Failed to register exit hook");
    }
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
    ] {
        let registered = unsafe {
            signal_hook::low_level::register(signal, move || {
                fire_exit_hook();
                let _ = signal_hook::low_level::emulate_default_handler(signal);
            })
        };
        if let Err(e) = registered {
            warn!("Failed to register handler for signal {}: {}", signal, e);
        }
    }
}

/// [`KernelChannel`] backed by real system calls.
#[derive(Debug, Clone)]
pub struct OsChannel {
    dev_dir: PathBuf,
}

impl Default for OsChannel {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from(DEVICE_DIR),
        }
    }
}

impl KernelChannel for OsChannel {
    fn open_device(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(path)
    }

    fn adopt_fd(&self, fd: RawFd) -> io::Result<File> {
        fstat(fd)?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn device_number(&self, fd: RawFd) -> io::Result<u64> {
        Ok(fstat(fd)?.st_rdev as u64)
    }

    fn device_name(&self, rdev: u64) -> Option<String> {
        let entries = match fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", self.dev_dir.display(), e);
                return None;
            }
        };
        entries.flatten().find_map(|entry| {
            let metadata = entry.metadata().ok()?;
            (metadata.file_type().is_char_device() && metadata.rdev() == rdev)
                .then(|| entry.file_name().to_string_lossy().into_owned())
        })
    }

    fn session_token(&self, fd: RawFd) -> io::Result<u32> {
        let mut token: u32 = 0;
        unsafe { ioctls::get_random(fd, &mut token) }?;
        Ok(token)
    }

    fn mark_dead(&self, fd: RawFd) -> io::Result<()> {
        let dummy: u32 = 0;
        unsafe { ioctls::set_daemon_dead(fd, &dummy) }?;
        Ok(())
    }

    fn send_fd(&self, sock: RawFd, fd: RawFd) -> io::Result<()> {
        let payload = [0u8; 1];
        let iov = [IoSlice::new(&payload)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        loop {
            match sendmsg::<UnixAddr>(sock, &iov, &cmsg, MsgFlags::empty(), None) {
                Ok(1) => return Ok(()),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("sent {} bytes instead of 1", n),
                    ))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[cfg(target_os = "macos")]
    fn mount(
        &self,
        fs_type: &str,
        path: &Path,
        flags: MntFlags,
        descriptor: &MountDescriptor,
    ) -> io::Result<()> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let fs_type = CString::new(fs_type).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let rc = unsafe {
            libc::mount(
                fs_type.as_ptr(),
                target.as_ptr(),
                flags.bits() as libc::c_int,
                descriptor as *const MountDescriptor as *mut libc::c_void,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn mount(
        &self,
        _fs_type: &str,
        _path: &Path,
        _flags: MntFlags,
        _descriptor: &MountDescriptor,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel extension mounts are only supported on macOS",
        ))
    }

    fn arm_exit_hook(&self, fd: RawFd) {
        HOOKS.call_once(register_exit_hooks);
        ARMED_FD.store(fd, Ordering::SeqCst);
    }

    fn disarm_exit_hook(&self) -> bool {
        ARMED_FD.swap(-1, Ordering::SeqCst) >= 0
    }
}
