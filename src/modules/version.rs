//! Operating system version probing.
//!
//! The driver bundle ships one build per operating system release, so the
//! loader needs the running system's version triple to find the right one.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::debug;
use nix::sys::utsname::uname;
use serde::Deserialize;

use super::constants::{EXTENSIONS_PATH, KEXT_NAME, SYSTEM_VERSION_PLIST};
use super::error::ReadError;

/// Version triple of the running operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SystemVersion {
    /// Major release, e.g. 10.
    pub major: u32,
    /// Minor release, e.g. 14.
    pub minor: u32,
    /// Bugfix release.
    pub bugfix: u32,
}

impl SystemVersion {
    /// Parses a dotted product version. Missing or non-numeric components are 0.
    pub fn parse(product_version: &str) -> Self {
        let mut parts = product_version.split('.').map(leading_int);
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            bugfix: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for SystemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.bugfix)
    }
}

#[derive(Deserialize)]
struct VersionDescriptor {
    #[serde(rename = "ProductVersion")]
    product_version: Option<String>,
}

/// Reads the system version descriptor and the kernel release.
#[derive(Debug)]
pub struct VersionProbe {
    descriptor: PathBuf,
    extensions_dir: PathBuf,
    kernel_release: Option<String>,
    cached: OnceLock<SystemVersion>,
}

impl Default for VersionProbe {
    fn default() -> Self {
        Self::new(SYSTEM_VERSION_PLIST, EXTENSIONS_PATH)
    }
}

impl VersionProbe {
    /// Creates a probe.
    ///
    /// # Arguments
    ///
    /// * `descriptor` - system version property list
    /// * `extensions_dir` - directory with one driver build per release
    pub fn new(descriptor: impl Into<PathBuf>, extensions_dir: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: descriptor.into(),
            extensions_dir: extensions_dir.into(),
            kernel_release: None,
            cached: OnceLock::new(),
        }
    }

    /// Pins the kernel release string instead of asking `uname`.
    pub fn with_kernel_release(mut self, release: impl Into<String>) -> Self {
        self.kernel_release = Some(release.into());
        self
    }

    /// Returns the system version, reading the descriptor on first use.
    pub fn system_version(&self) -> Result<SystemVersion, ReadError> {
        if let Some(version) = self.cached.get() {
            return Ok(*version);
        }
        let version = read_descriptor(&self.descriptor)?;
        debug!("System version {} from {}", version, self.descriptor.display());
        Ok(*self.cached.get_or_init(|| version))
    }

    /// Major component of the kernel release, e.g. `17` for `17.7.0`.
    pub fn kernel_major(&self) -> Option<u32> {
        let release = match &self.kernel_release {
            Some(release) => release.clone(),
            None => uname().ok()?.release().to_string_lossy().into_owned(),
        };
        let (major, _) = release.split_once('.')?;
        major.parse().ok()
    }

    /// Location of the driver build for `version`.
    pub fn driver_path(&self, version: &SystemVersion) -> PathBuf {
        self.extensions_dir
            .join(format!("{}.{}", version.major, version.minor))
            .join(KEXT_NAME)
    }
}

fn read_descriptor(path: &Path) -> Result<SystemVersion, ReadError> {
    let fail = |reason: String| ReadError {
        path: path.display().to_string(),
        reason,
    };
    let descriptor: VersionDescriptor = plist::from_file(path).map_err(|e| fail(e.to_string()))?;
    let product_version = descriptor
        .product_version
        .ok_or_else(|| fail("missing ProductVersion".to_string()))?;
    Ok(SystemVersion::parse(&product_version))
}

fn leading_int(component: &str) -> u32 {
    let digits: String = component
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
