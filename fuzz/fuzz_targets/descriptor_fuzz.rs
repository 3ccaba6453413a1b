#![no_main]
use arbitrary::Arbitrary;
use kextmount::modules::abi::{DeviceIdentity, MountDescriptor};
use kextmount::modules::options::{prepare, OptionRegistry, ResolveContext};
use kextmount::modules::personality::PersonalityRegistry;
use libfuzzer_sys::fuzz_target;
use std::path::Path;

#[derive(Debug, Arbitrary)]
struct Input {
    mount_point: String,
    options: Vec<String>,
    daemon_name: Option<String>,
    index: u32,
    token: u32,
    rdev: u64,
}

fuzz_target!(|input: Input| {
    let personalities = PersonalityRegistry::default();
    let ctx = ResolveContext {
        personalities: &personalities,
        daemon_name: input.daemon_name.as_deref(),
    };
    if let Ok(options) = prepare(&OptionRegistry::new(), &input.options, &ctx) {
        let device = DeviceIdentity {
            index: input.index,
            token: input.token,
            rdev: input.rdev,
        };
        let d = MountDescriptor::compose(
            Path::new(&input.mount_point),
            &options,
            device,
            input.daemon_name.as_deref(),
        );
        assert_eq!(d.mntpath[d.mntpath.len() - 1], 0);
        assert_eq!(d.fsname[d.fsname.len() - 1], 0);
        assert_eq!(d.fstypename[d.fstypename.len() - 1], 0);
        assert_eq!(d.volname[d.volname.len() - 1], 0);
    }
});
