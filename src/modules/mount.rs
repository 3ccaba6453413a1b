//! Mount session execution.
//!
//! This module provides the [`MountSessionExecutor`], which runs one mount
//! attempt from driver readiness to the final `mount(2)` call:
//!
//! 1. make sure the expected driver version is loaded
//! 2. resolve (and if needed create) the mount point
//! 3. drop privileges for good
//! 4. refuse mount points that already live on a FUSE volume
//! 5. acquire a device and negotiate the session token
//! 6. compose the mount descriptor
//! 7. hand the device to the daemon and mount

use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use super::abi::MountDescriptor;
use super::alert::{Alert, AlertDispatcher, AlertTopic};
use super::channel::KernelChannel;
use super::constants::*;
use super::device::{DeviceNegotiator, DeviceSource};
use super::driver::DriverLifecycleManager;
use super::error::{DriverError, MountError};
use super::host::Host;
use super::options::MountOptions;

/// Everything one mount attempt needs, validated up front.
#[derive(Debug, Clone)]
pub struct MountRequest {
    /// Mount point as given on the command line.
    pub mount_point: PathBuf,
    /// Validated options.
    pub options: MountOptions,
    /// Basename of the daemon binary.
    pub daemon_name: Option<String>,
    /// Socket that receives the device descriptor.
    pub comm_fd: Option<RawFd>,
    /// Where the device comes from.
    pub device: DeviceSource,
    /// Enable the driver's legacy compatibility tunable.
    pub compat_mode: bool,
}

/// Runs mount attempts against injected OS boundaries.
pub struct MountSessionExecutor {
    driver: DriverLifecycleManager,
    channel: Box<dyn KernelChannel>,
    host: Box<dyn Host>,
    alerts: Box<dyn AlertDispatcher>,
    volumes_dir: PathBuf,
}

impl MountSessionExecutor {
    /// Creates a new executor.
    ///
    /// # Arguments
    ///
    /// * `driver` - lifecycle manager used for the readiness step
    /// * `channel` - device and mount system calls
    /// * `host` - privilege changes and mount point access
    /// * `alerts` - receives driver failure and mount notifications
    pub fn new(
        driver: DriverLifecycleManager,
        channel: Box<dyn KernelChannel>,
        host: Box<dyn Host>,
        alerts: Box<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            driver,
            channel,
            host,
            alerts,
            volumes_dir: PathBuf::from(AUTO_VOLUMES_DIR),
        }
    }

    /// Directory whose direct children may be created with elevated privileges.
    pub fn with_volumes_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.volumes_dir = dir.into();
        self
    }

    /// Runs the mount attempt.
    ///
    /// # Returns
    ///
    /// * `Ok(PathBuf)` - the canonical mount point that was mounted
    /// * `Err(MountError)` - the first step that failed; an acquired device
    ///   is marked dead before returning
    pub fn run(&self, request: &MountRequest) -> Result<PathBuf, MountError> {
        self.ensure_driver(request.compat_mode)?;

        let mount_point = self.resolve_mount_point(&request.mount_point)?;
        self.host
            .drop_permanently()
            .map_err(|e| MountError::os("failed to drop privileges", e))?;
        self.check_recursion(&mount_point, &request.options)?;

        let negotiator = DeviceNegotiator::new(&*self.channel);
        let session = negotiator.acquire(&request.device)?;
        let device_label = format!("{}/{}{}", DEVICE_DIR, DEVICE_BASENAME, session.index());

        let descriptor = MountDescriptor::compose(
            &mount_point,
            &request.options,
            session.identity(),
            request.daemon_name.as_deref(),
        );
        debug!("{:?}", descriptor);

        if let Some(sock) = request.comm_fd {
            self.channel
                .send_fd(sock, session.fd())
                .map_err(|e| MountError::os("failed to send file descriptor", e))?;
        }

        self.channel
            .mount(FS_TYPE_NAME, &mount_point, request.options.mntflags, &descriptor)
            .map_err(|e| {
                error!("Mount of {} failed: {}", mount_point.display(), e);
                MountError::os(
                    format!("failed to mount {}@{}", mount_point.display(), device_label),
                    e,
                )
            })?;

        session.finalize();
        info!("Mounted {} on {}", device_label, mount_point.display());
        self.alerts.post(
            &Alert::new(AlertTopic::Mounted)
                .with(MOUNT_PATH_KEY, mount_point.to_string_lossy()),
        );
        Ok(mount_point)
    }

    fn ensure_driver(&self, compat_mode: bool) -> Result<(), MountError> {
        let elevated = match self.host.elevate() {
            Ok(()) => true,
            Err(e) => {
                debug!("Could not raise privileges for driver checks: {}", e);
                false
            }
        };
        let result = self.driver.ensure_current(compat_mode);
        if elevated {
            if let Err(e) = self.host.restore() {
                debug!("Could not restore privileges: {}", e);
            }
        }

        result.map_err(|err| {
            if let Some(topic) = alert_topic(&err) {
                self.alerts.post(&Alert::new(topic));
            }
            match err {
                DriverError::Other(msg) => MountError::unavailable(msg),
                err => MountError::unavailable(format!("the file system is not available ({})", err)),
            }
        })
    }

    fn resolve_mount_point(&self, path: &Path) -> Result<PathBuf, MountError> {
        let mut created = false;
        loop {
            match self.host.canonicalize(path) {
                Ok(canonical) if self.host.is_dir(&canonical) => return Ok(canonical),
                Ok(canonical) => {
                    return Err(MountError::usage(format!(
                        "{}: not a directory",
                        canonical.display()
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && !created => {
                    self.create_mount_point(path)?;
                    created = true;
                }
                Err(e) => return Err(MountError::usage(format!("{}: {}", path.display(), e))),
            }
        }
    }

    fn create_mount_point(&self, path: &Path) -> Result<(), MountError> {
        let auto_volume = path.parent() == Some(self.volumes_dir.as_path());
        if auto_volume {
            if let Err(e) = self.host.elevate() {
                debug!("Could not raise privileges to create {}: {}", path.display(), e);
            }
        }

        let created = self.host.create_dir(path);

        if auto_volume {
            let (uid, gid) = self.host.real_ids();
            if created.is_ok() {
                if let Err(e) = self.host.chown(path, uid, gid) {
                    debug!("Could not chown {}: {}", path.display(), e);
                }
            }
            if let Err(e) = self.host.restore() {
                debug!("Could not restore privileges: {}", e);
            }
        }

        created.map_err(|e| MountError::usage(format!("{}: {}", path.display(), e)))?;
        debug!("Created mount point {}", path.display());
        Ok(())
    }

    fn check_recursion(&self, mount_point: &Path, options: &MountOptions) -> Result<(), MountError> {
        let fs_type = self.host.fs_type_name(mount_point).map_err(|e| {
            debug!("statfs on {} failed: {}", mount_point.display(), e);
            MountError::File(format!("cannot stat the mount point {}", mount_point.display()))
        })?;
        if is_driver_fs_type(&fs_type) && !options.allows_recursion() {
            return Err(MountError::usage(format!(
                "mount point {} is itself on a {} volume",
                mount_point.display(),
                DISPLAY_NAME
            )));
        }
        Ok(())
    }
}

/// Whether `fs_type` names a volume served by this driver.
pub fn is_driver_fs_type(fs_type: &str) -> bool {
    fs_type == FS_TYPE_NAME || fs_type.starts_with(FS_TYPE_NAME_PREFIX)
}

fn alert_topic(err: &DriverError) -> Option<AlertTopic> {
    match err {
        DriverError::OsTooOld => Some(AlertTopic::OsTooOld),
        DriverError::NotFound => Some(AlertTopic::OsTooNew),
        DriverError::Busy => Some(AlertTopic::VersionMismatch),
        DriverError::PolicyBlocked => Some(AlertTopic::PolicyBlocked),
        DriverError::Other(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::abi::field_str;
    use crate::modules::driver::expected_version_report;
    use crate::modules::options::{prepare, OptionRegistry, ResolveContext};
    use crate::modules::personality::PersonalityRegistry;
    use crate::modules::testing::*;
    use crate::modules::version::VersionProbe;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        registry: FakeRegistry,
        facility: FakeFacility,
        channel: FakeChannel,
        host: FakeHost,
        alerts: RecordingDispatcher,
        executor: MountSessionExecutor,
    }

    fn harness(kernel: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let plist = dir.path().join("SystemVersion.plist");
        fs::write(
            &plist,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>ProductVersion</key><string>10.14.6</string></dict></plist>"#,
        )
        .unwrap();
        let ext = dir.path().join("Extensions");
        fs::create_dir_all(ext.join("10.14").join(KEXT_NAME)).unwrap();
        fs::create_dir(dir.path().join("Volumes")).unwrap();

        let registry = FakeRegistry::default();
        let facility = FakeFacility::new(registry.clone());
        let channel = FakeChannel::default();
        let host = FakeHost::new();
        let alerts = RecordingDispatcher::default();
        let driver = DriverLifecycleManager::new(
            Box::new(registry.clone()),
            Box::new(facility.clone()),
            VersionProbe::new(plist, ext).with_kernel_release(kernel),
        );
        let executor = MountSessionExecutor::new(
            driver,
            Box::new(channel.clone()),
            Box::new(host.clone()),
            Box::new(alerts.clone()),
        )
        .with_volumes_dir(dir.path().join("Volumes"));
        Harness {
            dir,
            registry,
            facility,
            channel,
            host,
            alerts,
            executor,
        }
    }

    fn request(mount_point: PathBuf, opts: &str) -> MountRequest {
        let personalities = PersonalityRegistry::default();
        let ctx = ResolveContext {
            personalities: &personalities,
            daemon_name: Some("sshfs"),
        };
        MountRequest {
            mount_point,
            options: prepare(&OptionRegistry::new(), &[opts], &ctx).unwrap(),
            daemon_name: Some("sshfs".to_string()),
            comm_fd: Some(9),
            device: DeviceSource::Probe,
            compat_mode: false,
        }
    }

    #[test]
    fn test_mounts_with_current_driver() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let mnt = h.dir.path().join("mnt");
        fs::create_dir(&mnt).unwrap();

        let mounted = h.executor.run(&request(mnt.clone(), "allow_other,nosuid"))?;
        assert_eq!(mounted, fs::canonicalize(&mnt).unwrap());
        assert!(h.facility.calls().is_empty());

        let mounts = h.channel.mounts();
        assert_eq!(mounts.len(), 1);
        let call = &mounts[0];
        assert_eq!(call.fs_type, FS_TYPE_NAME);
        assert_eq!(call.path, mounted);
        assert!(call.flags.contains(crate::modules::options::MntFlags::NOSUID));
        assert_eq!(field_str(&call.descriptor.fsname), "sshfs@osxfuse0");
        assert_eq!(field_str(&call.descriptor.volname), "OSXFUSE Volume 0 (sshfs)");
        assert_eq!(call.descriptor.random, FakeChannel::TOKEN);

        assert_eq!(h.channel.sent().len(), 1);
        assert_eq!(h.channel.sent()[0].0, 9);
        assert!(h.channel.dead().is_empty());
        assert_eq!(h.channel.armed(), None);

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].topic, AlertTopic::Mounted);
        assert_eq!(
            alerts[0].payload.get(MOUNT_PATH_KEY).cloned(),
            Some(mounted.to_string_lossy().into_owned())
        );
        Ok(())
    }

    #[test]
    fn test_privileges_restored_before_permanent_drop() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let mnt = h.dir.path().join("mnt");
        fs::create_dir(&mnt).unwrap();
        h.executor.run(&request(mnt, "debug"))?;
        assert_eq!(
            h.host.events(),
            vec![HostEvent::Elevate, HostEvent::Restore, HostEvent::DropPermanently]
        );
        Ok(())
    }

    #[test]
    fn test_loads_missing_driver_first() -> Result<(), MountError> {
        let h = harness("18.7.0");
        let mnt = h.dir.path().join("mnt");
        fs::create_dir(&mnt).unwrap();
        h.executor.run(&request(mnt, "allow_other"))?;
        assert!(matches!(h.facility.calls().as_slice(), [FacilityCall::Load(_)]));
        assert_eq!(h.channel.mounts().len(), 1);
        Ok(())
    }

    #[test]
    fn test_user_values_reach_descriptor_after_driver_load() -> Result<(), MountError> {
        let h = harness("18.7.0");
        let mnt = h.dir.path().join("Volumes").join("Test");
        let mounted = h
            .executor
            .run(&request(mnt.clone(), "blocksize=8192,volname=Test"))?;
        assert!(mnt.is_dir());

        let calls = h.facility.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], FacilityCall::Load(_)));

        let mounts = h.channel.mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].path, mounted);
        assert_eq!(mounts[0].descriptor.blocksize, 8192);
        assert_eq!(field_str(&mounts[0].descriptor.volname), "Test");
        assert!(h.channel.dead().is_empty());
        Ok(())
    }

    #[test]
    fn test_unload_refusal_alerts_version_mismatch() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(b"3.7.0\0".to_vec()));
        h.facility.fail_unload(DriverError::Other("busy".into()));
        let mnt = h.dir.path().join("mnt");
        fs::create_dir(&mnt).unwrap();

        let result = h.executor.run(&request(mnt, ""));
        assert!(matches!(result, Err(MountError::Unavailable(_))));
        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].topic, AlertTopic::VersionMismatch);
        assert!(h.channel.mounts().is_empty());
    }

    #[test]
    fn test_driver_failures_map_to_alerts() {
        for (kernel, failure, topic) in [
            ("10.8.0", None, AlertTopic::OsTooOld),
            ("18.7.0", Some(DriverError::NotFound), AlertTopic::OsTooNew),
            ("18.7.0", Some(DriverError::PolicyBlocked), AlertTopic::PolicyBlocked),
        ] {
            let h = harness(kernel);
            if let Some(err) = failure {
                h.facility.fail_load(err);
            }
            let result = h.executor.run(&request(h.dir.path().to_path_buf(), ""));
            assert!(matches!(result, Err(MountError::Unavailable(_))));
            let alerts = h.alerts.alerts();
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].topic, topic);
        }
    }

    #[test]
    fn test_other_driver_failure_has_no_alert() {
        let h = harness("18.7.0");
        h.facility.fail_load(DriverError::Other("kextload exited with status 71".into()));
        let result = h.executor.run(&request(h.dir.path().to_path_buf(), ""));
        assert!(matches!(result, Err(MountError::Unavailable(_))));
        assert!(h.alerts.alerts().is_empty());
    }

    #[test]
    fn test_recursive_mount_rejected_without_flag() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.host.set_fs_type(Some("osxfuse_sshfs"));
        let result = h.executor.run(&request(h.dir.path().to_path_buf(), ""));
        match result {
            Err(MountError::Usage(msg)) => assert!(msg.contains("is itself on a OSXFUSE volume")),
            other => panic!("unexpected {:?}", other),
        }
        // Rejected before any device was touched.
        assert_eq!(h.channel.armed(), None);
        assert!(h.channel.dead().is_empty());
    }

    #[test]
    fn test_recursive_mount_allowed_with_flag() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.host.set_fs_type(Some("osxfuse"));
        h.executor
            .run(&request(h.dir.path().to_path_buf(), "allow_recursion"))?;
        assert_eq!(h.channel.mounts().len(), 1);
        Ok(())
    }

    #[test]
    fn test_statfs_failure_is_file_error() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.host.set_fs_type(None);
        let result = h.executor.run(&request(h.dir.path().to_path_buf(), ""));
        assert!(matches!(result, Err(MountError::File(_))));
    }

    #[test]
    fn test_mount_point_must_be_directory() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let file = h.dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        match h.executor.run(&request(file, "")) {
            Err(MountError::Usage(msg)) => assert!(msg.ends_with(": not a directory")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_mount_point_is_created_unprivileged() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let mnt = h.dir.path().join("fresh");
        h.executor.run(&request(mnt.clone(), ""))?;
        assert!(mnt.is_dir());
        assert_eq!(
            h.host.events(),
            vec![
                HostEvent::Elevate,
                HostEvent::Restore,
                HostEvent::CreateDir(mnt),
                HostEvent::DropPermanently
            ]
        );
        Ok(())
    }

    #[test]
    fn test_volumes_mount_point_is_created_elevated() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let mnt = h.dir.path().join("Volumes").join("remote");
        h.executor.run(&request(mnt.clone(), ""))?;
        let events = h.host.events();
        assert_eq!(
            &events[2..],
            &[
                HostEvent::Elevate,
                HostEvent::CreateDir(mnt.clone()),
                HostEvent::Chown(mnt, FakeHost::UID, FakeHost::GID),
                HostEvent::Restore,
                HostEvent::DropPermanently
            ]
        );
        Ok(())
    }

    #[test]
    fn test_uncreatable_mount_point_is_usage_error() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let mnt = h.dir.path().join("missing").join("deeper");
        assert!(matches!(
            h.executor.run(&request(mnt, "")),
            Err(MountError::Usage(_))
        ));
    }

    #[test]
    fn test_failed_privilege_drop_is_os_error() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.host.fail_drop();
        let result = h.executor.run(&request(h.dir.path().to_path_buf(), ""));
        assert!(matches!(result, Err(MountError::Os { .. })));
    }

    #[test]
    fn test_send_failure_marks_device_dead() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.channel.fail_send(io::ErrorKind::BrokenPipe);
        match h.executor.run(&request(h.dir.path().to_path_buf(), "")) {
            Err(MountError::Os { context, .. }) => {
                assert_eq!(context, "failed to send file descriptor")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.channel.dead().len(), 1);
        assert!(h.channel.mounts().is_empty());
    }

    #[test]
    fn test_mount_failure_marks_device_dead() {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.channel.set_busy(&[0]);
        h.channel.fail_mount(io::ErrorKind::PermissionDenied);
        let mnt = fs::canonicalize(h.dir.path()).unwrap();
        match h.executor.run(&request(mnt.clone(), "")) {
            Err(MountError::Os { context, .. }) => {
                assert_eq!(context, format!("failed to mount {}@/dev/osxfuse1", mnt.display()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.channel.dead().len(), 1);
        assert!(h.alerts.alerts().is_empty());
    }

    #[test]
    fn test_without_comm_fd_nothing_is_sent() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        let mut req = request(h.dir.path().to_path_buf(), "");
        req.comm_fd = None;
        h.executor.run(&req)?;
        assert!(h.channel.sent().is_empty());
        assert_eq!(h.channel.mounts().len(), 1);
        Ok(())
    }

    #[test]
    fn test_inherited_descriptor_index_from_device_name() -> Result<(), MountError> {
        let h = harness("18.7.0");
        h.registry.set_loaded(Some(expected_version_report()));
        h.channel.set_adopt_name("osxfuse5");
        let mut req = request(h.dir.path().to_path_buf(), "");
        req.device = DeviceSource::Fd(12);
        h.executor.run(&req)?;
        let mounts = h.channel.mounts();
        assert_eq!(field_str(&mounts[0].descriptor.fsname), "sshfs@osxfuse5");
        Ok(())
    }

    #[test]
    fn test_driver_fs_type_names() {
        assert!(is_driver_fs_type("osxfuse"));
        assert!(is_driver_fs_type("osxfuse_sshfs"));
        assert!(!is_driver_fs_type("osxfusex"));
        assert!(!is_driver_fs_type("apfs"));
    }
}
