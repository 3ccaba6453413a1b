//! File system personalities advertised by the driver bundle.
//!
//! A personality pairs a daemon name (e.g. `sshfs`) with an fssubtype
//! number. The number ends up in the mount descriptor so the system can
//! tell FUSE file systems apart.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;

use super::constants::FSSUBTYPE_UNKNOWN;

/// One `FSPersonalities` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Personality {
    /// Personality name, matched against the daemon name.
    pub name: String,
    /// Declared `FSSubType`, if any.
    pub subtype: Option<u32>,
}

#[derive(Deserialize)]
struct BundleInfo {
    #[serde(rename = "FSPersonalities", default)]
    personalities: BTreeMap<String, PersonalityEntry>,
}

#[derive(Deserialize)]
struct PersonalityEntry {
    #[serde(rename = "FSSubType")]
    subtype: Option<u32>,
}

/// Read-only lookup table of known personalities.
#[derive(Debug, Clone, Default)]
pub struct PersonalityRegistry {
    entries: Vec<Personality>,
}

impl PersonalityRegistry {
    /// Builds a registry from known entries.
    pub fn from_entries(entries: Vec<Personality>) -> Self {
        Self { entries }
    }

    /// Loads the `FSPersonalities` dictionary from the bundle's property list.
    pub fn load(info_plist: &Path) -> Result<Self> {
        let info: BundleInfo = plist::from_file(info_plist)
            .with_context(|| format!("Failed to read personalities from {}", info_plist.display()))?;
        let entries = info
            .personalities
            .into_iter()
            .map(|(name, entry)| Personality {
                name,
                subtype: entry.subtype,
            })
            .collect();
        Ok(Self { entries })
    }

    /// Like [`load`](Self::load), but an unreadable bundle yields an empty registry.
    pub fn load_or_empty(info_plist: &Path) -> Self {
        Self::load(info_plist).unwrap_or_else(|e| {
            warn!("{:#}", e);
            Self::default()
        })
    }

    /// All entries in bundle order.
    pub fn entries(&self) -> &[Personality] {
        &self.entries
    }

    /// Resolves the fssubtype for a mount.
    ///
    /// A claimed subtype is kept when some personality declares it.
    /// Otherwise the first personality whose name appears in the daemon
    /// name (case-insensitively) decides. Anything else is unknown.
    pub fn find_subtype(&self, claimed: u32, daemon_name: Option<&str>) -> u32 {
        if self.entries.iter().any(|p| p.subtype == Some(claimed)) {
            return claimed;
        }
        let daemon = match daemon_name {
            Some(name) => name.to_lowercase(),
            None => return FSSUBTYPE_UNKNOWN,
        };
        self.entries
            .iter()
            .find(|p| daemon.contains(&p.name.to_lowercase()))
            .and_then(|p| p.subtype)
            .unwrap_or(FSSUBTYPE_UNKNOWN)
    }
}
