//! Compiled-in driver identity, paths, limits and defaults.

// Driver identity
/// File system type name the driver registers.
pub const FS_TYPE_NAME: &str = "osxfuse";
/// Prefix of per-daemon type names such as `osxfuse_sshfs`.
pub const FS_TYPE_NAME_PREFIX: &str = "osxfuse_";
/// Product name used in help, alerts and default volume names.
pub const DISPLAY_NAME: &str = "OSXFUSE";
/// Kernel extension bundle identifier.
pub const BUNDLE_IDENTIFIER: &str = "com.github.osxfuse.filesystems.osxfuse";
/// Driver version this helper was built against.
pub const DRIVER_VERSION: &str = "3.8.3";

// Devices
/// Directory holding the driver device nodes.
pub const DEVICE_DIR: &str = "/dev";
/// Device node name without its index.
pub const DEVICE_BASENAME: &str = "osxfuse";
/// Number of device slots the driver exposes.
pub const NDEVICES: u32 = 64;

// On-disk locations
/// Installed file system bundle.
pub const BUNDLE_PATH: &str = "/Library/Filesystems/osxfuse.fs";
/// Bundle property list carrying the personality table.
pub const BUNDLE_INFO_PLIST: &str = "/Library/Filesystems/osxfuse.fs/Contents/Info.plist";
/// Per-release kernel extension directories.
pub const EXTENSIONS_PATH: &str = "/Library/Filesystems/osxfuse.fs/Contents/Extensions";
/// Kernel extension directory name inside a release directory.
pub const KEXT_NAME: &str = "osxfuse.kext";
/// System version property list.
pub const SYSTEM_VERSION_PLIST: &str = "/System/Library/CoreServices/SystemVersion.plist";
/// Legacy loader utility.
pub const SYSTEM_KEXTLOAD: &str = "/sbin/kextload";
/// Legacy unloader utility.
pub const SYSTEM_KEXTUNLOAD: &str = "/sbin/kextunload";
/// Mount points directly below this directory are created with privileges.
pub const AUTO_VOLUMES_DIR: &str = "/Volumes";

// Kernel tunables
/// Version string of the loaded driver.
pub const SYSCTL_VERSION_NUMBER: &str = "vfs.generic.osxfuse.version.number";
/// Group allowed to use admin-only mount options.
pub const SYSCTL_TUNABLES_ADMIN: &str = "vfs.generic.osxfuse.tunables.admin_group";
/// Legacy MacFUSE compatibility switch.
pub const SYSCTL_MACFUSE_MODE: &str = "vfs.generic.osxfuse.control.macfuse_mode";
/// Group whose id is written to the admin tunable.
pub const ADMIN_GROUP_NAME: &str = "admin";

/// Oldest supported kernel release (major component of `uname -r`).
pub const MIN_KERNEL_MAJOR: u32 = 11;

// Mount value defaults and limits
/// Block size used when `blocksize=` is absent or malformed.
pub const DEFAULT_BLOCKSIZE: u32 = 4096;
/// Seconds the driver waits on the daemon before giving up.
pub const DEFAULT_DAEMON_TIMEOUT: u32 = 60;
/// Lower clamp for `daemon_timeout=`.
pub const MIN_DAEMON_TIMEOUT: u32 = 0;
/// Upper clamp for `daemon_timeout=`.
pub const MAX_DAEMON_TIMEOUT: u32 = 600;
/// I/O size used when `iosize=` is absent or malformed.
pub const DEFAULT_IOSIZE: u32 = 65536;
/// Bits a valid `fsid=` may use.
pub const FSID_MASK: u32 = 0x00FF_FFFF;
/// Subtype reported when no personality matches.
pub const FSSUBTYPE_UNKNOWN: u32 = 0;
/// Marker for a missing or malformed `fssubtype=`.
pub const FSSUBTYPE_INVALID: u32 = u32::MAX;

// Mount descriptor field sizes
/// Size of path fields in the mount descriptor.
pub const MAXPATHLEN: usize = 1024;
/// Size of the type name field in the mount descriptor.
pub const MFSTYPENAMELEN: usize = 16;
/// Longest `fstypename=` that still fits after the prefix and NUL.
pub const TYPE_NAME_MAXLEN: usize = MFSTYPENAMELEN - FS_TYPE_NAME_PREFIX.len() - 1;

/// Alert payload key for the mounted path.
pub const MOUNT_PATH_KEY: &str = "kFUSEMountPath";
