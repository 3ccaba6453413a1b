#![doc(html_root_url = "https://docs.rs/kextmount/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! kextmount: mount helper and driver loader for a kernel-resident FUSE driver
//!
//! The FUSE library runs this helper to turn a daemon's request into a
//! mounted volume. The helper makes sure the matching driver is loaded,
//! claims a driver device, and mounts it with a descriptor built from the
//! `-o` options.
//!
//! ## Features
//!
//! - Driver version check with automatic unload of stale drivers
//! - BSD style `-o` option parsing with conflict checks
//! - Exclusive device acquisition with session token negotiation
//! - Descriptor hand-off to the daemon over a unix socket
//! - Cleanup of half-negotiated devices on every failure path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kextmount::modules::options::{prepare, OptionRegistry, ResolveContext};
//! use kextmount::modules::personality::PersonalityRegistry;
//!
//! # fn main() -> Result<(), kextmount::MountError> {
//! let personalities = PersonalityRegistry::default();
//! let ctx = ResolveContext {
//!     personalities: &personalities,
//!     daemon_name: Some("sshfs"),
//! };
//! let options = prepare(&OptionRegistry::new(), &["allow_other,volname=Remote"], &ctx)?;
//! assert_eq!(options.values.volname.as_deref(), Some("Remote"));
//! # Ok(())
//! # }
//! ```

pub mod modules;

pub use modules::driver::{DriverLifecycleManager, Facility, SysctlRegistry};
pub use modules::error::{DriverError, MountError};
pub use modules::mount::{MountRequest, MountSessionExecutor};
pub use modules::options::{MountOptions, OptionRegistry};
