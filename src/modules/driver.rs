//! Kernel driver lifecycle: detect, validate, unload and load.
//!
//! The helper never mounts against a driver whose reported version differs
//! from the one it was built for. A stale driver is unloaded and the build
//! matching the running operating system is loaded in its place.

use std::io;
use std::path::Path;

use log::{debug, info, warn};

use super::constants::*;
use super::error::DriverError;
use super::helper::HelperCommand;
use super::version::VersionProbe;

/// Result of comparing the loaded driver against the expected version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    /// No file system of our type is registered.
    NotLoaded,
    /// Loaded, but the version report differs or could not be read.
    VersionMismatch,
    /// Loaded and reporting the expected version.
    Current,
}

/// Kernel configuration surface the lifecycle manager reads and writes.
pub trait DriverRegistry {
    /// Whether a file system type named `fs_type` is registered with the kernel.
    fn is_registered(&self, fs_type: &str) -> bool;
    /// Raw bytes of the driver version tunable, trailing NUL included.
    fn loaded_version(&self) -> io::Result<Vec<u8>>;
    /// Writes the admin group tunable.
    fn set_admin_group(&self, gid: u32) -> io::Result<()>;
    /// Writes the MacFUSE compatibility tunable.
    fn set_compat_mode(&self, enabled: bool) -> io::Result<()>;
    /// Group id of the administrative group, if it exists.
    fn admin_gid(&self) -> Option<u32>;
}

/// Loads and unloads driver bundles.
pub trait DriverFacility {
    /// Loads the kernel extension at `path`.
    fn load(&self, path: &Path) -> Result<(), DriverError>;
    /// Unloads the kernel extension with bundle identifier `bundle_id`.
    fn unload(&self, bundle_id: &str) -> Result<(), DriverError>;
}

/// Expected contents of the version tunable.
pub fn expected_version_report() -> Vec<u8> {
    let mut report = DRIVER_VERSION.as_bytes().to_vec();
    report.push(0);
    report
}

/// Drives the driver into the loaded-and-current state.
pub struct DriverLifecycleManager {
    registry: Box<dyn DriverRegistry>,
    facility: Box<dyn DriverFacility>,
    probe: VersionProbe,
}

impl DriverLifecycleManager {
    /// Creates a manager.
    ///
    /// # Arguments
    ///
    /// * `registry` - reads the loaded version and writes tunables
    /// * `facility` - loads and unloads the driver
    /// * `probe` - locates the driver build for the running system
    pub fn new(
        registry: Box<dyn DriverRegistry>,
        facility: Box<dyn DriverFacility>,
        probe: VersionProbe,
    ) -> Self {
        Self {
            registry,
            facility,
            probe,
        }
    }

    /// Classifies the currently loaded driver.
    pub fn check_version(&self) -> VersionStatus {
        if !self.registry.is_registered(FS_TYPE_NAME) {
            return VersionStatus::NotLoaded;
        }
        match self.registry.loaded_version() {
            Ok(report) if report == expected_version_report() => VersionStatus::Current,
            Ok(report) => {
                debug!(
                    "Loaded driver reports version {:?}, expected {}",
                    String::from_utf8_lossy(&report),
                    DRIVER_VERSION
                );
                VersionStatus::VersionMismatch
            }
            Err(e) => {
                debug!("Failed to query driver version: {}", e);
                VersionStatus::VersionMismatch
            }
        }
    }

    /// Unloads the driver by bundle identifier. Never retried.
    pub fn unload(&self) -> Result<(), DriverError> {
        self.facility.unload(BUNDLE_IDENTIFIER).map_err(|e| {
            warn!("Failed to unload {}: {}", BUNDLE_IDENTIFIER, e);
            DriverError::Busy
        })
    }

    /// Loads the driver build matching the running operating system.
    pub fn load(&self) -> Result<(), DriverError> {
        let version = self.probe.system_version().map_err(|e| {
            warn!("{}", e);
            DriverError::NotFound
        })?;
        let path = self.probe.driver_path(&version);
        if !path.exists() {
            warn!("No driver for {} at {}", version, path.display());
            return Err(DriverError::NotFound);
        }

        self.facility.load(&path)?;
        info!("Loaded driver from {}", path.display());

        match self.registry.admin_gid() {
            Some(gid) => {
                if let Err(e) = self.registry.set_admin_group(gid) {
                    debug!("Failed to set admin group tunable: {}", e);
                }
            }
            None => debug!("No {} group, admin tunable left unset", ADMIN_GROUP_NAME),
        }
        Ok(())
    }

    /// Ensures the expected driver version is loaded.
    ///
    /// # Arguments
    ///
    /// * `compat_mode` - also enable the legacy compatibility tunable once the
    ///   driver is current
    pub fn ensure_current(&self, compat_mode: bool) -> Result<(), DriverError> {
        match self.probe.kernel_major() {
            Some(major) if major < MIN_KERNEL_MAJOR => return Err(DriverError::OsTooOld),
            Some(_) => {}
            None => debug!("Kernel release unknown, skipping minimum version check"),
        }

        let status = self.check_version();
        debug!("Driver status: {:?}", status);
        if status != VersionStatus::Current {
            if status == VersionStatus::VersionMismatch {
                self.unload()?;
            }
            self.load()?;
            match self.check_version() {
                VersionStatus::Current => {}
                VersionStatus::NotLoaded => {
                    return Err(DriverError::Other(format!(
                        "the {} kernel extension is not loaded",
                        DISPLAY_NAME
                    )))
                }
                VersionStatus::VersionMismatch => {
                    return Err(DriverError::Other(format!(
                        "the loaded {} kernel extension has a mismatched version",
                        DISPLAY_NAME
                    )))
                }
            }
        }

        if compat_mode {
            if let Err(e) = self.registry.set_compat_mode(true) {
                debug!("Failed to enable compatibility mode: {}", e);
            }
        }
        Ok(())
    }
}

/// Load/unload mechanism, chosen once per process.
pub enum Facility {
    /// In-process calls into the kernel extension manager.
    Primary(KextManager),
    /// The system's command line load/unload utilities.
    LegacyForkExec,
}

impl Facility {
    /// Uses the kernel extension manager when it can be resolved.
    pub fn detect() -> Self {
        match KextManager::resolve() {
            Some(manager) => Facility::Primary(manager),
            None => {
                debug!("Kext manager unavailable, using {}", SYSTEM_KEXTLOAD);
                Facility::LegacyForkExec
            }
        }
    }
}

impl DriverFacility for Facility {
    fn load(&self, path: &Path) -> Result<(), DriverError> {
        match self {
            Facility::Primary(manager) => manager.load(path),
            Facility::LegacyForkExec => {
                let status = HelperCommand::new(SYSTEM_KEXTLOAD)
                    .arg(path.to_string_lossy())
                    .run()
                    .map_err(|e| DriverError::Other(format!("{:#}", e)))?;
                exit_status_result(SYSTEM_KEXTLOAD, status)
            }
        }
    }

    fn unload(&self, bundle_id: &str) -> Result<(), DriverError> {
        match self {
            Facility::Primary(manager) => manager.unload(bundle_id),
            Facility::LegacyForkExec => {
                let status = HelperCommand::new(SYSTEM_KEXTUNLOAD)
                    .arg("-b")
                    .arg(bundle_id)
                    .run()
                    .map_err(|e| DriverError::Other(format!("{:#}", e)))?;
                exit_status_result(SYSTEM_KEXTUNLOAD, status)
            }
        }
    }
}

fn exit_status_result(program: &str, status: i32) -> Result<(), DriverError> {
    if status == 0 {
        Ok(())
    } else {
        Err(DriverError::Other(format!("{} exited with status {}", program, status)))
    }
}

/// `kOSKextReturnNotFound`
pub const KOS_KEXT_RETURN_NOT_FOUND: i32 = 0xDC00_8006_u32 as i32;
/// `kOSKextReturnSystemPolicy`
pub const KOS_KEXT_RETURN_SYSTEM_POLICY: i32 = 0xDC00_801B_u32 as i32;

/// Maps a kernel extension manager return code onto a lifecycle error.
pub fn map_kext_return(code: i32) -> Result<(), DriverError> {
    match code {
        0 => Ok(()),
        KOS_KEXT_RETURN_NOT_FOUND => Err(DriverError::NotFound),
        KOS_KEXT_RETURN_SYSTEM_POLICY => Err(DriverError::PolicyBlocked),
        other => Err(DriverError::Other(format!("kext manager returned {:#x}", other))),
    }
}

#[cfg(target_os = "macos")]
mod kext {
    use std::ffi::{c_void, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use super::map_kext_return;
    use crate::modules::error::DriverError;

    type CFTypeRef = *const c_void;
    type CFAllocatorRef = *const c_void;
    type CFIndex = isize;
    type OSReturn = i32;

    const CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;
    const IOKIT_PATH: &[u8] = b"/System/Library/Frameworks/IOKit.framework/IOKit\0";
    const LOAD_SYMBOL: &[u8] = b"KextManagerLoadKextWithURL\0";
    const UNLOAD_SYMBOL: &[u8] = b"KextManagerUnloadKextWithIdentifier\0";

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        fn CFURLCreateFromFileSystemRepresentation(
            allocator: CFAllocatorRef,
            buffer: *const u8,
            len: CFIndex,
            is_directory: u8,
        ) -> CFTypeRef;
        fn CFStringCreateWithCString(
            allocator: CFAllocatorRef,
            c_str: *const libc::c_char,
            encoding: u32,
        ) -> CFTypeRef;
        fn CFRelease(cf: CFTypeRef);
    }

    type LoadFn = unsafe extern "C" fn(url: CFTypeRef, dependencies: CFTypeRef) -> OSReturn;
    type UnloadFn = unsafe extern "C" fn(identifier: CFTypeRef) -> OSReturn;

    /// Entry points of the kernel extension manager, resolved at runtime.
    pub struct KextManager {
        load_fn: LoadFn,
        unload_fn: UnloadFn,
    }

    impl KextManager {
        /// Resolves the load and unload entry points from IOKit.
        pub fn resolve() -> Option<Self> {
            unsafe {
                let handle = libc::dlopen(IOKIT_PATH.as_ptr() as *const libc::c_char, libc::RTLD_LAZY);
                if handle.is_null() {
                    return None;
                }
                let load = libc::dlsym(handle, LOAD_SYMBOL.as_ptr() as *const libc::c_char);
                let unload = libc::dlsym(handle, UNLOAD_SYMBOL.as_ptr() as *const libc::c_char);
                if load.is_null() || unload.is_null() {
                    return None;
                }
                Some(Self {
                    load_fn: std::mem::transmute::<*mut c_void, LoadFn>(load),
                    unload_fn: std::mem::transmute::<*mut c_void, UnloadFn>(unload),
                })
            }
        }

        /// Loads the kernel extension bundle at `path`.
        pub fn load(&self, path: &Path) -> Result<(), DriverError> {
            let bytes = path.as_os_str().as_bytes();
            let code = unsafe {
                let url = CFURLCreateFromFileSystemRepresentation(
                    std::ptr::null(),
                    bytes.as_ptr(),
                    bytes.len() as CFIndex,
                    1,
                );
                if url.is_null() {
                    return Err(DriverError::Other(format!("invalid driver path {}", path.display())));
                }
                let code = (self.load_fn)(url, std::ptr::null());
                CFRelease(url);
                code
            };
            map_kext_return(code)
        }

        /// Unloads the kernel extension with identifier `bundle_id`.
        pub fn unload(&self, bundle_id: &str) -> Result<(), DriverError> {
            let id = CString::new(bundle_id)
                .map_err(|_| DriverError::Other("bundle identifier contains NUL".to_string()))?;
            let code = unsafe {
                let string = CFStringCreateWithCString(std::ptr::null(), id.as_ptr(), CF_STRING_ENCODING_UTF8);
                if string.is_null() {
                    return Err(DriverError::Other(format!("invalid bundle identifier {}", bundle_id)));
                }
                let code = (self.unload_fn)(string);
                CFRelease(string);
                code
            };
            map_kext_return(code)
        }
    }
}

#[cfg(not(target_os = "macos"))]
mod kext {
    use std::path::Path;

    use crate::modules::error::DriverError;

    /// The kernel extension manager only exists on macOS.
    pub struct KextManager(());

    impl KextManager {
        /// Always `None` off macOS.
        pub fn resolve() -> Option<Self> {
            None
        }

        /// Always fails off macOS.
        pub fn load(&self, _path: &Path) -> Result<(), DriverError> {
            Err(DriverError::Other("kext manager unavailable".to_string()))
        }

        /// Always fails off macOS.
        pub fn unload(&self, _bundle_id: &str) -> Result<(), DriverError> {
            Err(DriverError::Other("kext manager unavailable".to_string()))
        }
    }
}

pub use kext::KextManager;

/// `DriverRegistry` backed by `sysctl` and the VFS configuration table.
#[derive(Debug, Default)]
pub struct SysctlRegistry;

#[cfg(target_os = "macos")]
mod sysctl {
    use std::ffi::{c_void, CString};
    use std::io;

    #[repr(C)]
    struct VfsConf {
        vfc_reserved1: u32,
        vfc_name: [libc::c_char; 15],
        vfc_typenum: libc::c_int,
        vfc_refcount: libc::c_int,
        vfc_flags: libc::c_int,
        vfc_reserved2: u32,
        vfc_reserved3: u32,
    }

    extern "C" {
        fn getvfsbyname(name: *const libc::c_char, vfc: *mut VfsConf) -> libc::c_int;
    }

    pub fn vfs_registered(fs_type: &str) -> bool {
        let Ok(name) = CString::new(fs_type) else {
            return false;
        };
        let mut conf = std::mem::MaybeUninit::<VfsConf>::zeroed();
        unsafe { getvfsbyname(name.as_ptr(), conf.as_mut_ptr()) == 0 }
    }

    pub fn read(name: &str) -> io::Result<Vec<u8>> {
        let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut len: libc::size_t = 0;
        let rc = unsafe {
            libc::sysctlbyname(name.as_ptr(), std::ptr::null_mut(), &mut len, std::ptr::null_mut(), 0)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf = vec![0u8; len];
        let rc = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                buf.as_mut_ptr() as *mut c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(len);
        Ok(buf)
    }

    pub fn write<T>(name: &str, value: &T) -> io::Result<()> {
        let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let rc = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                value as *const T as *mut c_void,
                std::mem::size_of::<T>(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "macos"))]
mod sysctl {
    use std::io;

    pub fn vfs_registered(_fs_type: &str) -> bool {
        false
    }

    pub fn read(_name: &str) -> io::Result<Vec<u8>> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn write<T>(_name: &str, _value: &T) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

impl DriverRegistry for SysctlRegistry {
    fn is_registered(&self, fs_type: &str) -> bool {
        sysctl::vfs_registered(fs_type)
    }

    fn loaded_version(&self) -> io::Result<Vec<u8>> {
        sysctl::read(SYSCTL_VERSION_NUMBER)
    }

    fn set_admin_group(&self, gid: u32) -> io::Result<()> {
        sysctl::write(SYSCTL_TUNABLES_ADMIN, &gid)
    }

    fn set_compat_mode(&self, enabled: bool) -> io::Result<()> {
        sysctl::write(SYSCTL_MACFUSE_MODE, &libc::c_int::from(enabled))
    }

    fn admin_gid(&self) -> Option<u32> {
        match nix::unistd::Group::from_name(ADMIN_GROUP_NAME) {
            Ok(group) => group.map(|g| g.gid.as_raw()),
            Err(e) => {
                debug!("Group lookup for {} failed: {}", ADMIN_GROUP_NAME, e);
                None
            }
        }
    }
}
