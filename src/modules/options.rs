//! Mount option registry, parser, value resolution and conflict checks.
//!
//! Options arrive as comma separated `-o` strings. Each token is matched
//! against an immutable registry built from [`MountOption`]; matched
//! tokens set or clear a bit in either the generic mount flags word or the
//! driver specific alternate flags word. Value-bearing options also keep
//! the text after `=` for the value resolution pass.

use std::collections::HashMap;

use bitflags::bitflags;
use log::debug;

use super::constants::*;
use super::error::MountError;
use super::personality::PersonalityRegistry;

bitflags! {
    /// Generic flags passed as the `flags` argument of `mount(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MntFlags: u32 {
        /// Read-only mount
        const RDONLY = 0x0000_0001;
        /// All I/O is synchronous
        const SYNCHRONOUS = 0x0000_0002;
        /// No program execution
        const NOEXEC = 0x0000_0004;
        /// Set-id bits are ignored
        const NOSUID = 0x0000_0008;
        /// Device special files are not interpreted
        const NODEV = 0x0000_0010;
        /// Union with the underlying file system
        const UNION = 0x0000_0020;
        /// All I/O is asynchronous
        const ASYNC = 0x0000_0040;
        /// Files are quarantined
        const QUARANTINE = 0x0000_0400;
        /// Change the flags of an existing mount
        const UPDATE = 0x0001_0000;
        /// Hidden from the Finder
        const DONTBROWSE = 0x0010_0000;
        /// File ownership is ignored
        const IGNORE_OWNERSHIP = 0x0020_0000;
        /// Mounted by the automounter
        const AUTOMOUNTED = 0x0040_0000;
        /// Writes are deferred
        const DEFWRITE = 0x0200_0000;
        /// Access times are not updated
        const NOATIME = 0x1000_0000;
    }
}

bitflags! {
    /// Driver specific flags carried in the mount descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AltFlags: u64 {
        /// Users other than the mounter may access the volume
        const ALLOW_OTHER = 1 << 0;
        /// The mount point may itself be on a FUSE volume
        const ALLOW_RECURSION = 1 << 1;
        /// Root may access the volume
        const ALLOW_ROOT = 1 << 2;
        /// Cache invalidation follows modification times
        const AUTO_CACHE = 1 << 3;
        /// Extended attributes go through `._` files only
        const AUTO_XATTR = 1 << 4;
        /// `blocksize=` was given
        const BLOCKSIZE = 1 << 5;
        /// `daemon_timeout=` was given
        const DAEMON_TIMEOUT = 1 << 6;
        /// Debug output
        const DEBUG = 1 << 7;
        /// The kernel checks permissions
        const DEFAULT_PERMISSIONS = 1 << 8;
        /// Permission checks are left to the daemon
        const DEFER_PERMISSIONS = 1 << 9;
        /// Bypass the buffer cache
        const DIRECT_IO = 1 << 10;
        /// ACL support
        const EXTENDED_SECURITY = 1 << 11;
        /// `fsid=` was given
        const FSID = 1 << 12;
        /// `fsname=` was given
        const FSNAME = 1 << 13;
        /// `fssubtype=` was given
        const FSSUBTYPE = 1 << 14;
        /// `fstypename=` was given
        const FSTYPENAME = 1 << 15;
        /// `iosize=` was given
        const IOSIZE = 1 << 16;
        /// Symbolic links stay inside the mount
        const JAIL_SYMLINKS = 1 << 17;
        /// The daemon is killed on unmount
        const KILL_ON_UNMOUNT = 1 << 18;
        /// The volume is reported as local
        const LOCALVOL = 1 << 19;
        /// Cache lookups of missing names
        const NEGATIVE_VNCACHE = 1 << 20;
        /// No user alerts from the driver
        const NO_ALERTS = 1 << 21;
        /// Hide `._` and `.DS_Store` files
        const NO_APPLEDOUBLE = 1 << 22;
        /// Hide `com.apple.*` extended attributes
        const NO_APPLEXATTR = 1 << 23;
        /// No attribute cache
        const NO_ATTRCACHE = 1 << 24;
        /// Hidden from the Finder
        const NO_BROWSE = 1 << 25;
        /// Meta flag for all four cache switches
        const NO_LOCALCACHES = 1 << 26;
        /// No read-ahead
        const NO_READAHEAD = 1 << 27;
        /// No sync on close
        const NO_SYNCONCLOSE = 1 << 28;
        /// No synchronous writes
        const NO_SYNCWRITES = 1 << 29;
        /// No unified buffer cache
        const NO_UBC = 1 << 30;
        /// No vnode name cache
        const NO_VNCACHE = 1 << 31;
        /// Inode numbers come from the daemon
        const USE_INO = 1 << 32;
        /// `volname=` was given
        const VOLNAME = 1 << 33;
        /// Extended attributes are passed to the daemon
        const NATIVE_XATTR = 1 << 34;
        /// Sparse file support
        const SPARSE = 1 << 35;
        /// File system statistics are not cached
        const SLOW_STATFS = 1 << 36;
        /// Exclusive create is passed to the daemon
        const EXCL_CREATE = 1 << 37;
    }
}

/// Which flags word an option writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionTarget {
    /// A bit of the generic mount flags.
    Generic(MntFlags),
    /// A bit of the driver's alternate flags.
    Driver(AltFlags),
}

/// Static description of one recognised option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDescriptor {
    /// The option this entry describes.
    pub option: MountOption,
    /// Match key. Value-bearing options end in `=`.
    pub name: &'static str,
    /// The option is written with a leading `no` to set its flag.
    pub inverse: bool,
    /// Flag the option sets or clears.
    pub target: OptionTarget,
    /// Help line; empty options are left out of the help banner.
    pub help: &'static str,
}

impl OptionDescriptor {
    /// Whether the option carries a value after `=`.
    pub fn takes_value(&self) -> bool {
        self.name.ends_with('=')
    }
}

macro_rules! mount_options {
    ($($variant:ident => $name:literal, $inverse:literal, $target:expr, $help:literal;)*) => {
        /// Every option the helper understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MountOption {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )*
        }

        impl MountOption {
            /// Registry order. The first match for a token wins.
            pub const ALL: &'static [MountOption] = &[$(MountOption::$variant,)*];

            /// Static description of this option.
            pub fn descriptor(self) -> OptionDescriptor {
                match self {
                    $(MountOption::$variant => OptionDescriptor {
                        option: self,
                        name: $name,
                        inverse: $inverse,
                        target: $target,
                        help: $help,
                    },)*
                }
            }
        }
    };
}

use OptionTarget::{Driver, Generic};

mount_options! {
    Rdonly => "rdonly", false, Generic(MntFlags::RDONLY), "";
    Ro => "ro", false, Generic(MntFlags::RDONLY), "";
    Rw => "rw", true, Generic(MntFlags::RDONLY), "";
    Sync => "sync", false, Generic(MntFlags::SYNCHRONOUS), "";
    Async => "async", false, Generic(MntFlags::ASYNC), "";
    Exec => "exec", true, Generic(MntFlags::NOEXEC), "";
    Suid => "suid", true, Generic(MntFlags::NOSUID), "";
    Dev => "dev", true, Generic(MntFlags::NODEV), "";
    Union => "union", false, Generic(MntFlags::UNION), "";
    Atime => "atime", true, Generic(MntFlags::NOATIME), "";
    Browse => "browse", true, Generic(MntFlags::DONTBROWSE), "mark the volume as non-browsable by the Finder";
    Automounted => "automounted", false, Generic(MntFlags::AUTOMOUNTED), "";
    Defwrite => "defwrite", false, Generic(MntFlags::DEFWRITE), "";
    Quarantine => "quarantine", false, Generic(MntFlags::QUARANTINE), "";
    Owners => "owners", true, Generic(MntFlags::IGNORE_OWNERSHIP), "";
    Perm => "perm", true, Generic(MntFlags::IGNORE_OWNERSHIP), "";
    Update => "update", false, Generic(MntFlags::UPDATE), "";
    AllowOther => "allow_other", false, Driver(AltFlags::ALLOW_OTHER), "allow access to others besides the user who mounted the file system";
    AllowRecursion => "allow_recursion", false, Driver(AltFlags::ALLOW_RECURSION), "allow a mount point that itself resides on a FUSE volume";
    AllowRoot => "allow_root", false, Driver(AltFlags::ALLOW_ROOT), "allow access to root (can't be used with allow_other)";
    AutoCache => "auto_cache", false, Driver(AltFlags::AUTO_CACHE), "enable caching based on modification times";
    AutoXattr => "auto_xattr", false, Driver(AltFlags::AUTO_XATTR), "handle extended attributes entirely through ._ files";
    Blocksize => "blocksize=", false, Driver(AltFlags::BLOCKSIZE), "specify block size in bytes of \"storage\"";
    DaemonTimeout => "daemon_timeout=", false, Driver(AltFlags::DAEMON_TIMEOUT), "timeout in seconds for kernel calls to daemon";
    Debug => "debug", false, Driver(AltFlags::DEBUG), "turn on debug information printing";
    DefaultPermissions => "default_permissions", false, Driver(AltFlags::DEFAULT_PERMISSIONS), "let the kernel handle permission checks locally";
    DeferPermissions => "defer_permissions", false, Driver(AltFlags::DEFER_PERMISSIONS), "defer permission checks to file operations themselves";
    DirectIo => "direct_io", false, Driver(AltFlags::DIRECT_IO), "use alternative (direct) path for kernel-user I/O";
    ExclCreate => "excl_create", false, Driver(AltFlags::EXCL_CREATE), "pass the exclusive flag of create requests to the daemon";
    ExtendedSecurity => "extended_security", false, Driver(AltFlags::EXTENDED_SECURITY), "turn on extended security (ACLs)";
    Fsid => "fsid=", false, Driver(AltFlags::FSID), "set the second 32-bit component of the fsid";
    Fsname => "fsname=", false, Driver(AltFlags::FSNAME), "set the file system's name";
    Fssubtype => "fssubtype=", false, Driver(AltFlags::FSSUBTYPE), "set the file system's fssubtype identifier";
    Fstypename => "fstypename=", false, Driver(AltFlags::FSTYPENAME), "set the file system's type name";
    Iosize => "iosize=", false, Driver(AltFlags::IOSIZE), "specify maximum I/O size in bytes";
    JailSymlinks => "jail_symlinks", false, Driver(AltFlags::JAIL_SYMLINKS), "contain symbolic links within the mount";
    Local => "local", false, Driver(AltFlags::LOCALVOL), "mark the volume as \"local\" (default is \"nonlocal\")";
    NativeXattr => "native_xattr", false, Driver(AltFlags::NATIVE_XATTR), "use native extended attributes";
    NegativeVncache => "negative_vncache", false, Driver(AltFlags::NEGATIVE_VNCACHE), "enable vnode name caching of non-existent objects";
    Sparse => "sparse", false, Driver(AltFlags::SPARSE), "enable support for sparse files";
    SlowStatfs => "slow_statfs", false, Driver(AltFlags::SLOW_STATFS), "do not cache file system statistics";
    UseIno => "use_ino", false, Driver(AltFlags::USE_INO), "use the inode numbers supplied by the daemon";
    Volname => "volname=", false, Driver(AltFlags::VOLNAME), "set the file system's volume name";
    Alerts => "alerts", true, Driver(AltFlags::NO_ALERTS), "disable all graphical alerts";
    Appledouble => "appledouble", true, Driver(AltFlags::NO_APPLEDOUBLE), "ignore Apple Double (._) and .DS_Store files entirely";
    Applexattr => "applexattr", true, Driver(AltFlags::NO_APPLEXATTR), "ignore all \"com.apple.*\" extended attributes";
    Attrcache => "attrcache", true, Driver(AltFlags::NO_ATTRCACHE), "disable the attribute cache";
    Localcaches => "localcaches", true, Driver(AltFlags::NO_LOCALCACHES), "meta option equivalent to noattrcache,noreadahead,noubc,novncache";
    Readahead => "readahead", true, Driver(AltFlags::NO_READAHEAD), "disable I/O read-ahead behavior for this file system";
    Synconclose => "synconclose", true, Driver(AltFlags::NO_SYNCONCLOSE), "disable sync-on-close behavior (enabled by default)";
    Syncwrites => "syncwrites", true, Driver(AltFlags::NO_SYNCWRITES), "disable synchronous-writes behavior (dangerous)";
    Ubc => "ubc", true, Driver(AltFlags::NO_UBC), "disable the unified buffer cache for this file system";
    Vncache => "vncache", true, Driver(AltFlags::NO_VNCACHE), "disable the vnode name cache for this file system";
}

/// Options that carry a value after `=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueField {
    /// `blocksize=`
    Blocksize,
    /// `daemon_timeout=`
    DaemonTimeout,
    /// `fsid=`
    Fsid,
    /// `fsname=`
    Fsname,
    /// `fssubtype=`
    Fssubtype,
    /// `fstypename=`
    Fstypename,
    /// `iosize=`
    Iosize,
    /// `volname=`
    Volname,
}

impl ValueField {
    /// Every field, in resolution order.
    pub const ALL: [ValueField; 8] = [
        ValueField::Blocksize,
        ValueField::DaemonTimeout,
        ValueField::Fsid,
        ValueField::Fsname,
        ValueField::Fssubtype,
        ValueField::Fstypename,
        ValueField::Iosize,
        ValueField::Volname,
    ];

    /// The option that sets this field.
    pub fn option(self) -> MountOption {
        match self {
            ValueField::Blocksize => MountOption::Blocksize,
            ValueField::DaemonTimeout => MountOption::DaemonTimeout,
            ValueField::Fsid => MountOption::Fsid,
            ValueField::Fsname => MountOption::Fsname,
            ValueField::Fssubtype => MountOption::Fssubtype,
            ValueField::Fstypename => MountOption::Fstypename,
            ValueField::Iosize => MountOption::Iosize,
            ValueField::Volname => MountOption::Volname,
        }
    }

    /// The field `option` sets, if it takes a value.
    pub fn for_option(option: MountOption) -> Option<ValueField> {
        Self::ALL.into_iter().find(|field| field.option() == option)
    }
}

/// Immutable option registry, built once and passed by reference.
#[derive(Debug, Clone)]
pub struct OptionRegistry {
    descriptors: Vec<OptionDescriptor>,
}

impl Default for OptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionRegistry {
    /// Builds the registry from every [`MountOption`] in order.
    pub fn new() -> Self {
        Self {
            descriptors: MountOption::ALL.iter().map(|o| o.descriptor()).collect(),
        }
    }

    /// Descriptors in match order.
    pub fn descriptors(&self) -> &[OptionDescriptor] {
        &self.descriptors
    }

    /// Finds the first descriptor whose name matches `key`, ignoring case.
    pub fn lookup(&self, key: &str) -> Option<&OptionDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(key))
    }

    /// Parses every `-o` argument in order into one flag/value set.
    pub fn parse<S: AsRef<str>>(&self, args: &[S]) -> Result<ParsedOptions, MountError> {
        let mut parsed = ParsedOptions::default();
        for arg in args {
            self.parse_into(arg.as_ref(), &mut parsed)?;
        }
        debug!(
            "Parsed options: mntflags={:#x} altflags={:#x}",
            parsed.mntflags.bits(),
            parsed.altflags.bits()
        );
        Ok(parsed)
    }

    fn parse_into(&self, arg: &str, parsed: &mut ParsedOptions) -> Result<(), MountError> {
        for token in arg.split(',').filter(|t| !t.is_empty()) {
            let (negative, body) = match token.strip_prefix("no") {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let (key, value) = match body.find('=') {
                Some(i) => (&body[..=i], Some(&body[i + 1..])),
                None => (body, None),
            };

            let descriptor = self.lookup(key).ok_or_else(|| unsupported(self, key))?;
            let set = negative == descriptor.inverse;
            parsed.apply(descriptor.target, set);

            if let Some(field) = ValueField::for_option(descriptor.option) {
                match (set, value) {
                    (true, Some(value)) => {
                        parsed.raw_values.insert(field, value.to_string());
                    }
                    (false, _) => {
                        parsed.raw_values.remove(&field);
                    }
                    (true, None) => {}
                }
            }
        }
        Ok(())
    }

    /// Option list for the help banner.
    pub fn help_text(&self) -> String {
        let mut positive = String::new();
        let mut negative = String::new();
        for d in self.descriptors.iter().filter(|d| !d.help.is_empty()) {
            let label = match (d.inverse, d.takes_value()) {
                (true, _) => format!("no{}", d.name),
                (false, true) => format!("{}<value>", d.name),
                (false, false) => d.name.to_string(),
            };
            let line = format!("    -o {:<22} {}\n", label, d.help);
            if d.inverse {
                negative.push_str(&line);
            } else {
                positive.push_str(&line);
            }
        }
        format!(
            "Available mount options:\n{}\nAvailable negative mount options:\n{}",
            positive, negative
        )
    }
}

/// Result of parsing the `-o` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOptions {
    /// Generic mount flags as set by the options.
    pub mntflags: MntFlags,
    /// Driver flags before meta-option expansion.
    pub altflags: AltFlags,
    /// Unconverted text after `=`, last occurrence wins.
    pub raw_values: HashMap<ValueField, String>,
}

impl Default for ParsedOptions {
    fn default() -> Self {
        Self {
            mntflags: MntFlags::empty(),
            altflags: AltFlags::empty(),
            raw_values: HashMap::new(),
        }
    }
}

/// Inputs the value converters need beyond the raw strings.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Subtype table from the driver bundle.
    pub personalities: &'a PersonalityRegistry,
    /// Basename of the daemon binary.
    pub daemon_name: Option<&'a str>,
}

/// Typed option values after conversion, defaulting and clamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountValues {
    /// Block size in bytes.
    pub blocksize: u32,
    /// Daemon timeout in seconds.
    pub daemon_timeout: u32,
    /// File system id, 0 when unset.
    pub fsid: u32,
    /// Mount source name; a default is derived when `None`.
    pub fsname: Option<String>,
    /// Resolved personality subtype.
    pub fssubtype: u32,
    /// Type name suffix.
    pub fstypename: Option<String>,
    /// Maximum I/O size in bytes.
    pub iosize: u32,
    /// Volume name; a default is derived when `None`.
    pub volname: Option<String>,
}

impl Default for MountValues {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            daemon_timeout: DEFAULT_DAEMON_TIMEOUT,
            fsid: 0,
            fsname: None,
            fssubtype: FSSUBTYPE_UNKNOWN,
            fstypename: None,
            iosize: DEFAULT_IOSIZE,
            volname: None,
        }
    }
}

/// Parsed, resolved and validated options ready for the mount pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Generic flags for `mount(2)`.
    pub mntflags: MntFlags,
    /// Validated driver flags.
    pub altflags: AltFlags,
    /// Resolved values.
    pub values: MountValues,
}

impl MountOptions {
    /// Whether `allow_recursion` was given.
    pub fn allows_recursion(&self) -> bool {
        self.altflags.contains(AltFlags::ALLOW_RECURSION)
    }
}

enum Rule {
    Exclusive(AltFlags, AltFlags),
    Requires(AltFlags, AltFlags),
}

const CONFLICT_RULES: &[(Rule, &str)] = &[
    (
        Rule::Exclusive(AltFlags::NEGATIVE_VNCACHE, AltFlags::NO_VNCACHE),
        "'negative_vncache' can't be used with 'novncache'",
    ),
    (
        Rule::Exclusive(
            AltFlags::NO_SYNCWRITES,
            AltFlags::NO_UBC.union(AltFlags::NO_READAHEAD),
        ),
        "disabling local caching can't be used with 'nosyncwrites'",
    ),
    (
        Rule::Requires(AltFlags::NO_SYNCONCLOSE, AltFlags::NO_SYNCWRITES),
        "the 'nosynconclose' option requires 'nosyncwrites'",
    ),
    (
        Rule::Exclusive(AltFlags::DEFAULT_PERMISSIONS, AltFlags::DEFER_PERMISSIONS),
        "'default_permissions' can't be used with 'defer_permissions'",
    ),
    (
        Rule::Exclusive(AltFlags::AUTO_XATTR, AltFlags::NATIVE_XATTR),
        "'auto_xattr' can't be used with 'native_xattr'",
    ),
];

impl ParsedOptions {
    fn apply(&mut self, target: OptionTarget, set: bool) {
        match target {
            OptionTarget::Generic(flag) => self.mntflags.set(flag, set),
            OptionTarget::Driver(flag) => self.altflags.set(flag, set),
        }
    }

    /// Converts every captured raw value into its typed field.
    ///
    /// Malformed sizes fall back to their defaults; a malformed `fssubtype`
    /// goes through the personality lookup as invalid.
    ///
    /// # Returns
    ///
    /// * `Ok(MountValues)` - the resolved values
    /// * `Err(MountError::Usage)` - for a bad `fsid` or an over-long `fstypename`
    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<MountValues, MountError> {
        let mut values = MountValues::default();
        for field in ValueField::ALL {
            let raw = self.raw_values.get(&field).map(String::as_str);
            match field {
                ValueField::Blocksize => {
                    values.blocksize = unsigned_or(field, raw, DEFAULT_BLOCKSIZE)
                }
                ValueField::DaemonTimeout => {
                    values.daemon_timeout = unsigned_or(field, raw, DEFAULT_DAEMON_TIMEOUT)
                }
                ValueField::Iosize => values.iosize = unsigned_or(field, raw, DEFAULT_IOSIZE),
                ValueField::Fsid => {
                    if let Some(raw) = raw {
                        values.fsid = parse_unsigned(raw)
                            .filter(|fsid| *fsid != 0 && fsid & !FSID_MASK == 0)
                            .ok_or_else(|| {
                                MountError::usage(
                                    "invalid value for argument fsid (must be 0 < fsid < 0xFFFFFF)",
                                )
                            })?;
                    }
                }
                ValueField::Fssubtype => {
                    let claimed = raw.and_then(parse_unsigned).unwrap_or(FSSUBTYPE_INVALID);
                    values.fssubtype = ctx.personalities.find_subtype(claimed, ctx.daemon_name);
                }
                ValueField::Fsname => values.fsname = raw.map(str::to_string),
                ValueField::Volname => values.volname = raw.map(str::to_string),
                ValueField::Fstypename => {
                    if let Some(name) = raw {
                        if name.len() > TYPE_NAME_MAXLEN {
                            return Err(MountError::usage(format!(
                                "fstypename can be at most {} characters",
                                TYPE_NAME_MAXLEN
                            )));
                        }
                    }
                    values.fstypename = raw.map(str::to_string);
                }
            }
        }
        Ok(values)
    }

    /// Resolves values, validates flags and clamps the daemon timeout.
    pub fn finish(&self, ctx: &ResolveContext<'_>) -> Result<MountOptions, MountError> {
        let mut values = self.resolve(ctx)?;
        let altflags = self.validate()?;
        values.daemon_timeout = clamp_daemon_timeout(values.daemon_timeout);
        Ok(MountOptions {
            mntflags: self.mntflags,
            altflags,
            values,
        })
    }

    /// Whether `-o debug` was given.
    pub fn debug(&self) -> bool {
        self.altflags.contains(AltFlags::DEBUG)
    }

    /// Expands meta options and rejects incompatible combinations.
    pub fn validate(&self) -> Result<AltFlags, MountError> {
        let mut altflags = self.altflags;
        if altflags.contains(AltFlags::NO_LOCALCACHES) {
            altflags |= AltFlags::NO_ATTRCACHE
                | AltFlags::NO_READAHEAD
                | AltFlags::NO_UBC
                | AltFlags::NO_VNCACHE;
        }

        for (rule, message) in CONFLICT_RULES {
            let violated = match rule {
                Rule::Exclusive(a, b) => altflags.contains(*a) && altflags.intersects(*b),
                Rule::Requires(a, b) => altflags.contains(*a) && !altflags.contains(*b),
            };
            if violated {
                return Err(MountError::usage(*message));
            }
        }
        Ok(altflags)
    }
}

/// Clamps the daemon timeout into the range the driver accepts.
pub fn clamp_daemon_timeout(timeout: u32) -> u32 {
    timeout.clamp(MIN_DAEMON_TIMEOUT, MAX_DAEMON_TIMEOUT)
}

fn unsigned_or(field: ValueField, raw: Option<&str>, fallback: u32) -> u32 {
    match raw {
        None => fallback,
        Some(raw) => parse_unsigned(raw).unwrap_or_else(|| {
            debug!("Ignoring malformed {:?} value {:?}", field, raw);
            fallback
        }),
    }
}

fn unsupported(registry: &OptionRegistry, key: &str) -> MountError {
    let name = key.strip_suffix('=').unwrap_or(key);
    if name.len() < key.len() && registry.lookup(name).is_some() {
        MountError::usage(format!("-o {}: option does not take a value", name))
    } else {
        MountError::usage(format!("-o {}: option not supported", name))
    }
}

/// Parses, resolves and validates the `-o` arguments in one pass.
pub fn prepare<S: AsRef<str>>(
    registry: &OptionRegistry,
    args: &[S],
    ctx: &ResolveContext<'_>,
) -> Result<MountOptions, MountError> {
    registry.parse(args)?.finish(ctx)
}

/// Leading decimal digits as `u32`. `None` when there are no digits or
/// the number does not fit.
fn parse_unsigned(raw: &str) -> Option<u32> {
    let trimmed = raw.trim_start();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    trimmed[..end].parse::<u32>().ok()
}
