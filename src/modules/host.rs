//! Process privileges and mount point file system access.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::debug;
use nix::unistd::{self, Gid, Uid};

/// Privilege and file system operations the mount executor performs.
pub trait Host {
    /// Real user and group id of the invoking user.
    fn real_ids(&self) -> (u32, u32);
    /// Raises the effective ids to root.
    fn elevate(&self) -> io::Result<()>;
    /// Returns the effective ids to the real ones.
    fn restore(&self) -> io::Result<()>;
    /// Drops to the real ids for good: group first, then user.
    fn drop_permanently(&self) -> io::Result<()>;
    /// Resolves `path` to an absolute path without symlinks.
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
    /// Whether `path` is a directory.
    fn is_dir(&self, path: &Path) -> bool;
    /// Creates `path` with mode 0755.
    fn create_dir(&self, path: &Path) -> io::Result<()>;
    /// Changes the owner of `path`.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
    /// Type name of the file system containing `path`.
    fn fs_type_name(&self, path: &Path) -> io::Result<String>;
}

/// The running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsHost;

impl Host for OsHost {
    fn real_ids(&self) -> (u32, u32) {
        (unistd::getuid().as_raw(), unistd::getgid().as_raw())
    }

    fn elevate(&self) -> io::Result<()> {
        unistd::seteuid(Uid::from_raw(0))?;
        unistd::setegid(Gid::from_raw(0))?;
        Ok(())
    }

    fn restore(&self) -> io::Result<()> {
        let (uid, gid) = self.real_ids();
        // Group first while we may still be root.
        unistd::setegid(Gid::from_raw(gid))?;
        unistd::seteuid(Uid::from_raw(uid))?;
        Ok(())
    }

    fn drop_permanently(&self) -> io::Result<()> {
        let (uid, gid) = self.real_ids();
        unistd::setgid(Gid::from_raw(gid))?;
        unistd::setuid(Uid::from_raw(uid))?;
        debug!("Dropped privileges to {}:{}", uid, gid);
        Ok(())
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new().mode(0o755).create(path)
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn fs_type_name(&self, path: &Path) -> io::Result<String> {
        let stat = nix::sys::statfs::statfs(path)?;
        Ok(stat.filesystem_type_name().to_string())
    }

    #[cfg(not(target_os = "macos"))]
    fn fs_type_name(&self, path: &Path) -> io::Result<String> {
        let path = fs::canonicalize(path)?;
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        mount_type_for(&mounts, &path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mount entry covers {}", path.display()),
            )
        })
    }
}

/// Picks the longest mount point prefix of `path` in a mounts table.
#[cfg_attr(target_os = "macos", allow(dead_code))]
fn mount_type_for(mounts: &str, path: &Path) -> Option<String> {
    let mut best: Option<(PathBuf, String)> = None;
    for line in mounts.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let mnt = PathBuf::from(parts[1]);
        if !path.starts_with(&mnt) {
            continue;
        }
        let longer = match &best {
            None => true,
            Some((b, _)) => mnt.as_os_str().len() > b.as_os_str().len(),
        };
        if longer {
            best = Some((mnt, parts[2].to_string()));
        }
    }
    best.map(|(_, fs_type)| fs_type)
}
