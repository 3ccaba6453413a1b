//! In-memory stand-ins for the OS boundary traits.
//!
//! Each fake keeps its state behind `Rc<RefCell<..>>` so a test can hand a
//! clone to the code under test and inspect its own handle afterwards.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::abi::MountDescriptor;
use super::alert::{Alert, AlertDispatcher};
use super::channel::KernelChannel;
use super::driver::{expected_version_report, DriverFacility, DriverRegistry};
use super::error::DriverError;
use super::host::Host;
use super::options::MntFlags;

#[derive(Default)]
struct RegistryState {
    loaded: Option<Vec<u8>>,
    version_fails: bool,
    admin_gid: Option<u32>,
    admin_group: Option<u32>,
    compat_mode: bool,
}

#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Rc<RefCell<RegistryState>>,
}

impl FakeRegistry {
    pub fn set_loaded(&self, report: Option<Vec<u8>>) {
        self.state.borrow_mut().loaded = report;
    }

    pub fn fail_version_query(&self) {
        self.state.borrow_mut().version_fails = true;
    }

    pub fn set_admin_gid(&self, gid: Option<u32>) {
        self.state.borrow_mut().admin_gid = gid;
    }

    pub fn admin_group(&self) -> Option<u32> {
        self.state.borrow().admin_group
    }

    pub fn compat_mode(&self) -> bool {
        self.state.borrow().compat_mode
    }
}

impl DriverRegistry for FakeRegistry {
    fn is_registered(&self, _fs_type: &str) -> bool {
        self.state.borrow().loaded.is_some()
    }

    fn loaded_version(&self) -> io::Result<Vec<u8>> {
        let state = self.state.borrow();
        if state.version_fails {
            return Err(io::ErrorKind::PermissionDenied.into());
        }
        state.loaded.clone().ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn set_admin_group(&self, gid: u32) -> io::Result<()> {
        self.state.borrow_mut().admin_group = Some(gid);
        Ok(())
    }

    fn set_compat_mode(&self, enabled: bool) -> io::Result<()> {
        self.state.borrow_mut().compat_mode = enabled;
        Ok(())
    }

    fn admin_gid(&self) -> Option<u32> {
        self.state.borrow().admin_gid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilityCall {
    Load(PathBuf),
    Unload(String),
}

struct FacilityState {
    calls: Vec<FacilityCall>,
    load_error: Option<DriverError>,
    unload_error: Option<DriverError>,
    loads_version: Option<Vec<u8>>,
}

/// Facility whose loads and unloads update a [`FakeRegistry`].
#[derive(Clone)]
pub struct FakeFacility {
    registry: FakeRegistry,
    state: Rc<RefCell<FacilityState>>,
}

impl FakeFacility {
    pub fn new(registry: FakeRegistry) -> Self {
        Self {
            registry,
            state: Rc::new(RefCell::new(FacilityState {
                calls: Vec::new(),
                load_error: None,
                unload_error: None,
                loads_version: Some(expected_version_report()),
            })),
        }
    }

    pub fn calls(&self) -> Vec<FacilityCall> {
        self.state.borrow().calls.clone()
    }

    pub fn fail_load(&self, err: DriverError) {
        self.state.borrow_mut().load_error = Some(err);
    }

    pub fn fail_unload(&self, err: DriverError) {
        self.state.borrow_mut().unload_error = Some(err);
    }

    /// Version report a successful load leaves behind; `None` leaves nothing registered.
    pub fn set_loads_version(&self, report: Option<Vec<u8>>) {
        self.state.borrow_mut().loads_version = report;
    }
}

impl DriverFacility for FakeFacility {
    fn load(&self, path: &Path) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(FacilityCall::Load(path.to_path_buf()));
        if let Some(err) = state.load_error.clone() {
            return Err(err);
        }
        self.registry.set_loaded(state.loads_version.clone());
        Ok(())
    }

    fn unload(&self, bundle_id: &str) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(FacilityCall::Unload(bundle_id.to_string()));
        if let Some(err) = state.unload_error.clone() {
            return Err(err);
        }
        self.registry.set_loaded(None);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MountCall {
    pub fs_type: String,
    pub path: PathBuf,
    pub flags: MntFlags,
    pub descriptor: MountDescriptor,
}

#[derive(Default)]
struct ChannelState {
    busy: HashSet<u32>,
    rdevs: HashMap<RawFd, u64>,
    names: HashMap<u64, String>,
    adopt_name: Option<String>,
    token_error: Option<io::ErrorKind>,
    send_error: Option<io::ErrorKind>,
    mount_error: Option<io::ErrorKind>,
    armed: Option<RawFd>,
    dead: Vec<RawFd>,
    sent: Vec<(RawFd, RawFd)>,
    mounts: Vec<MountCall>,
    opened: Vec<PathBuf>,
}

/// Device channel backed by anonymous temp files.
///
/// Device nodes named `osxfuse<N>` get device number `0x2300_0000 | N`;
/// any other name gets a number that maps back to that name.
#[derive(Clone, Default)]
pub struct FakeChannel {
    state: Rc<RefCell<ChannelState>>,
}

impl FakeChannel {
    pub const TOKEN: u32 = 0x5EED_1234;

    pub fn set_busy(&self, indices: &[u32]) {
        self.state.borrow_mut().busy = indices.iter().copied().collect();
    }

    /// Device name an adopted descriptor resolves to.
    pub fn set_adopt_name(&self, name: &str) {
        self.state.borrow_mut().adopt_name = Some(name.to_string());
    }

    pub fn fail_token(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().token_error = Some(kind);
    }

    pub fn fail_send(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().send_error = Some(kind);
    }

    pub fn fail_mount(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().mount_error = Some(kind);
    }

    pub fn armed(&self) -> Option<RawFd> {
        self.state.borrow().armed
    }

    pub fn dead(&self) -> Vec<RawFd> {
        self.state.borrow().dead.clone()
    }

    pub fn sent(&self) -> Vec<(RawFd, RawFd)> {
        self.state.borrow().sent.clone()
    }

    pub fn mounts(&self) -> Vec<MountCall> {
        self.state.borrow().mounts.clone()
    }

    /// Device paths that were opened successfully, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.state.borrow().opened.clone()
    }

    fn register(&self, file: &File, name: &str) {
        let mut state = self.state.borrow_mut();
        let rdev = match name
            .strip_prefix("osxfuse")
            .and_then(|n| n.parse::<u64>().ok())
        {
            Some(index) => 0x2300_0000 | index,
            None => 0x0300_0000 | state.names.len() as u64,
        };
        state.names.insert(rdev, name.to_string());
        state.rdevs.insert(file.as_raw_fd(), rdev);
    }
}

impl KernelChannel for FakeChannel {
    fn open_device(&self, path: &Path) -> io::Result<File> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let busy = name
            .strip_prefix("osxfuse")
            .and_then(|n| n.parse::<u32>().ok())
            .map_or(false, |index| self.state.borrow().busy.contains(&index));
        if busy {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let file = tempfile::tempfile()?;
        self.register(&file, &name);
        self.state.borrow_mut().opened.push(path.to_path_buf());
        Ok(file)
    }

    fn adopt_fd(&self, fd: RawFd) -> io::Result<File> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let file = tempfile::tempfile()?;
        let name = self
            .state
            .borrow()
            .adopt_name
            .clone()
            .unwrap_or_else(|| "osxfuse0".to_string());
        self.register(&file, &name);
        Ok(file)
    }

    fn device_number(&self, fd: RawFd) -> io::Result<u64> {
        self.state
            .borrow()
            .rdevs
            .get(&fd)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn device_name(&self, rdev: u64) -> Option<String> {
        self.state.borrow().names.get(&rdev).cloned()
    }

    fn session_token(&self, _fd: RawFd) -> io::Result<u32> {
        match self.state.borrow().token_error {
            Some(kind) => Err(kind.into()),
            None => Ok(Self::TOKEN),
        }
    }

    fn mark_dead(&self, fd: RawFd) -> io::Result<()> {
        self.state.borrow_mut().dead.push(fd);
        Ok(())
    }

    fn send_fd(&self, sock: RawFd, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.send_error {
            return Err(kind.into());
        }
        state.sent.push((sock, fd));
        Ok(())
    }

    fn mount(
        &self,
        fs_type: &str,
        path: &Path,
        flags: MntFlags,
        descriptor: &MountDescriptor,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.mount_error {
            return Err(kind.into());
        }
        state.mounts.push(MountCall {
            fs_type: fs_type.to_string(),
            path: path.to_path_buf(),
            flags,
            descriptor: descriptor.clone(),
        });
        Ok(())
    }

    fn arm_exit_hook(&self, fd: RawFd) {
        self.state.borrow_mut().armed = Some(fd);
    }

    fn disarm_exit_hook(&self) -> bool {
        self.state.borrow_mut().armed.take().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Elevate,
    Restore,
    DropPermanently,
    CreateDir(PathBuf),
    Chown(PathBuf, u32, u32),
}

struct HostState {
    events: Vec<HostEvent>,
    fs_type: Option<String>,
    fail_drop: bool,
}

/// Real file system access with recorded privilege changes.
#[derive(Clone)]
pub struct FakeHost {
    state: Rc<RefCell<HostState>>,
}

impl FakeHost {
    pub const UID: u32 = 501;
    pub const GID: u32 = 20;

    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(HostState {
                events: Vec::new(),
                fs_type: Some("apfs".to_string()),
                fail_drop: false,
            })),
        }
    }

    /// `None` makes the type query fail.
    pub fn set_fs_type(&self, fs_type: Option<&str>) {
        self.state.borrow_mut().fs_type = fs_type.map(str::to_string);
    }

    pub fn fail_drop(&self) {
        self.state.borrow_mut().fail_drop = true;
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.state.borrow().events.clone()
    }

    fn record(&self, event: HostEvent) {
        self.state.borrow_mut().events.push(event);
    }
}

impl Host for FakeHost {
    fn real_ids(&self) -> (u32, u32) {
        (Self::UID, Self::GID)
    }

    fn elevate(&self) -> io::Result<()> {
        self.record(HostEvent::Elevate);
        Ok(())
    }

    fn restore(&self) -> io::Result<()> {
        self.record(HostEvent::Restore);
        Ok(())
    }

    fn drop_permanently(&self) -> io::Result<()> {
        self.record(HostEvent::DropPermanently);
        if self.state.borrow().fail_drop {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.record(HostEvent::CreateDir(path.to_path_buf()));
        fs::create_dir(path)
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.record(HostEvent::Chown(path.to_path_buf(), uid, gid));
        Ok(())
    }

    fn fs_type_name(&self, _path: &Path) -> io::Result<String> {
        self.state
            .borrow()
            .fs_type
            .clone()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EACCES))
    }
}

/// Dispatcher that keeps every posted alert.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    alerts: Rc<RefCell<Vec<Alert>>>,
}

impl RecordingDispatcher {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.borrow().clone()
    }
}

impl AlertDispatcher for RecordingDispatcher {
    fn post(&self, alert: &Alert) {
        self.alerts.borrow_mut().push(alert.clone());
    }
}
