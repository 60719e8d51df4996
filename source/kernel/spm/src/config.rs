// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SPM configuration knobs and the platform manifest
//! OWNERS: @spm-team
//! PUBLIC API: SpmConfig, PlatformManifest (+ entries), ConfigError,
//!             PlatformManifest::from_toml (feature `manifest`)
//! DEPENDS_ON: serde (derive), toml (feature `manifest`)
//! INVARIANTS: Defaults are deterministic and valid; validation runs before any knob is used
//!
//! Knobs default to the values a small Level 2 platform ships with. Host builds can load
//! a complete platform (regions, partitions, services) from TOML:
//!
//! ```toml
//! [spm]
//! isolation_level = 2
//! named_resources = ["TIMER0"]
//!
//! [[region]]
//! base = 0x3000_0000
//! len = 0x1000
//! write = true
//! unpriv = true
//! ```

use alloc::string::String;
use alloc::vec::Vec;

use psa_abi::Sid;
use serde::Deserialize;
use thiserror::Error;

use crate::boundary::{BoundaryManager, IsolationLevel, PartitionDescriptor, RotClass};
use crate::isolation::{RegionAttrs, RegionDescriptor, RegionTable};
use crate::mem::{BusError, SystemMemory};
use crate::sched::Priority;
use crate::service::{ServiceDescriptor, VersionPolicy};
use crate::types::{PartitionId, Region};

const DEFAULT_STATELESS_SLOTS: usize = 8;
const DEFAULT_MAX_SESSIONS: usize = 16;
const DEFAULT_QUEUE_DEPTH: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("manifest parse error: {0}")]
    Toml(String),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: &'static str },
    #[error("region {base:#010x} references unknown resource {resource:?}")]
    UnknownResource { base: u32, resource: String },
}

/// Tunables of the SPM core.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpmConfig {
    pub isolation_level: IsolationLevel,
    /// Connections available to calls on stateless services, shared by all clients.
    pub stateless_slots: usize,
    pub max_sessions: usize,
    /// Messages queued per service before callers see busy.
    pub queue_depth: usize,
    /// Platform peripherals partitions may name; index is the token bit.
    pub named_resources: Vec<String>,
}

impl Default for SpmConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::Level2,
            stateless_slots: DEFAULT_STATELESS_SLOTS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            named_resources: Vec::new(),
        }
    }
}

impl SpmConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stateless_slots == 0 {
            return Err(ConfigError::InvalidField { field: "stateless_slots", reason: "must be at least 1" });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::InvalidField { field: "queue_depth", reason: "must be at least 1" });
        }
        if self.max_sessions > u16::MAX as usize {
            return Err(ConfigError::InvalidField { field: "max_sessions", reason: "must fit 16 bits" });
        }
        if self.named_resources.len() > crate::boundary::MAX_NAMED_RESOURCES {
            return Err(ConfigError::InvalidField { field: "named_resources", reason: "at most 8 entries" });
        }
        Ok(())
    }
}

const fn yes() -> bool {
    true
}

/// `[[region]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionEntry {
    pub base: u32,
    pub len: u32,
    #[serde(default = "yes")]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub unpriv: bool,
    #[serde(default)]
    pub non_secure: bool,
    /// Named resource gating this region.
    #[serde(default)]
    pub resource: Option<String>,
}

/// `[[partition]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionEntry {
    pub id: PartitionId,
    pub name: String,
    pub rot: RotClass,
    #[serde(default)]
    pub ns_agent: bool,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub stack_base: u32,
    pub stack_len: u32,
    pub entry: u32,
    #[serde(default)]
    pub mmio: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Sid>,
}

const fn default_priority() -> Priority {
    Priority::Normal
}

/// `[[service]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    pub sid: Sid,
    pub name: String,
    pub partition: PartitionId,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub policy: VersionPolicy,
    #[serde(default)]
    pub stateless: bool,
    #[serde(default)]
    pub non_secure_clients: bool,
}

const fn default_version() -> u32 {
    1
}

/// Complete description of a platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformManifest {
    #[serde(default)]
    pub spm: SpmConfig,
    #[serde(default, rename = "region")]
    pub regions: Vec<RegionEntry>,
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionEntry>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceEntry>,
}

impl PlatformManifest {
    /// Parses and validates a manifest.
    #[cfg(feature = "manifest")]
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        use alloc::string::ToString;

        let manifest: Self = toml::from_str(input).map_err(|err| ConfigError::Toml(err.to_string()))?;
        manifest.spm.validate()?;
        Ok(manifest)
    }

    /// Region table with named regions resolved against `boundaries`.
    pub fn region_table(&self, boundaries: &BoundaryManager) -> Result<RegionTable, ConfigError> {
        let mut table = RegionTable::new();
        for entry in &self.regions {
            let mut attrs = RegionAttrs::empty();
            attrs.set(RegionAttrs::READ, entry.read);
            attrs.set(RegionAttrs::WRITE, entry.write);
            attrs.set(RegionAttrs::UNPRIV, entry.unpriv);
            attrs.set(RegionAttrs::NON_SECURE, entry.non_secure);
            let mut desc = RegionDescriptor::new(Region::new(entry.base, entry.len), attrs);
            if let Some(resource) = &entry.resource {
                let idx = boundaries.resource_index(resource).ok_or_else(|| ConfigError::UnknownResource {
                    base: entry.base,
                    resource: resource.clone(),
                })?;
                desc = desc.named(idx);
            }
            table
                .add(desc)
                .map_err(|_| ConfigError::InvalidField { field: "region", reason: "overlapping or empty region" })?;
        }
        Ok(table)
    }

    /// Simulated RAM with one bank per region.
    pub fn memory(&self) -> Result<SystemMemory, BusError> {
        let mut mem = SystemMemory::new();
        for entry in &self.regions {
            mem.add_bank(Region::new(entry.base, entry.len))?;
        }
        Ok(mem)
    }

    pub fn partition_descriptors(&self) -> impl Iterator<Item = PartitionDescriptor> + '_ {
        self.partitions.iter().map(|p| PartitionDescriptor {
            id: p.id,
            name: p.name.clone(),
            rot: p.rot,
            ns_agent: p.ns_agent,
            priority: p.priority,
            stack: Region::new(p.stack_base, p.stack_len),
            entry: p.entry,
            mmio: p.mmio.clone(),
            dependencies: p.dependencies.clone(),
        })
    }

    pub fn service_descriptors(&self) -> impl Iterator<Item = ServiceDescriptor> + '_ {
        self.services.iter().map(|s| ServiceDescriptor {
            sid: s.sid,
            name: s.name.clone(),
            partition: s.partition,
            version: s.version,
            policy: s.policy,
            stateless: s.stateless,
            non_secure_clients: s.non_secure_clients,
        })
    }
}
