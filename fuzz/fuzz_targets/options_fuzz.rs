#![no_main]
use kextmount::modules::options::{prepare, AltFlags, OptionRegistry, ResolveContext};
use kextmount::modules::personality::PersonalityRegistry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(opts) = std::str::from_utf8(data) {
        let registry = OptionRegistry::new();
        let personalities = PersonalityRegistry::default();
        let ctx = ResolveContext {
            personalities: &personalities,
            daemon_name: Some("fuzzfs"),
        };
        if let Ok(options) = prepare(&registry, &[opts], &ctx) {
            assert!(options.values.daemon_timeout <= 600);
            assert!(options.values.fsid <= 0x00FF_FFFF);
            assert!(!(options.altflags.contains(AltFlags::AUTO_XATTR)
                && options.altflags.contains(AltFlags::NATIVE_XATTR)));
        }
    }
});
