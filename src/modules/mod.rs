//! Core mount helper modules.
//!
//! - `constants`: driver identity, paths and option defaults
//! - `config`: launch environment captured at startup
//! - `error`: error taxonomy and exit statuses
//! - `version`: operating system version probing
//! - `driver`: driver load/unload lifecycle
//! - `helper`: fork/exec runner for the legacy loader
//! - `options`: mount option registry, parsing and validation
//! - `personality`: fssubtype lookup from the driver bundle
//! - `abi`: the mount descriptor passed to the driver
//! - `channel`: device ioctls, descriptor passing and `mount(2)`
//! - `host`: privilege changes and mount point access
//! - `device`: device acquisition and token negotiation
//! - `session`: ownership of one negotiated device
//! - `mount`: the mount session executor
//! - `alert`: user-facing notifications

pub mod abi;
pub mod alert;
pub mod channel;
pub mod config;
pub mod constants;
pub mod device;
pub mod driver;
pub mod error;
pub mod helper;
pub mod host;
pub mod mount;
pub mod options;
pub mod personality;
pub mod session;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;
