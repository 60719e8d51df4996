// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Partition isolation boundaries: binding, activation and switch decisions
//! OWNERS: @spm-team
//! PUBLIC API: BoundaryToken, IsolationLevel, RotClass, PartitionDescriptor, BoundaryManager
//!             (bind/token_of/activate), needs_switch, reload_named_regions, BoundaryError
//! DEPENDS_ON: arch::ArchOps, arch::fatal
//! INVARIANTS: A partition's token is computed once and cached; activation re-checks the cache;
//!             token bits are only interpreted here and in `isolation`
//!
//! Token layout (`u32`):
//!
//! ```text
//!  31                 16 15        8 7     4 3   2  1   0
//! +---------------------+-----------+-------+-----+---+---+
//! | named-resource mask |    rsv    | level | rsv |NS |PRV|
//! +---------------------+-----------+-------+-----+---+---+
//! ```

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use psa_abi::Sid;
use serde::Deserialize;
use thiserror::Error;

use crate::arch::{fatal, ArchOps, Fatal};
use crate::sched::Priority;
use crate::types::{PartitionId, Region};

const PRIV_BIT: u32 = 1 << 0;
const NS_BIT: u32 = 1 << 1;
const LEVEL_SHIFT: u32 = 4;
const LEVEL_MASK: u32 = 0xf << LEVEL_SHIFT;
const RESOURCE_SHIFT: u32 = 16;

/// Maximum number of named resources a platform may declare; one protection region each.
pub const MAX_NAMED_RESOURCES: usize = 8;

/// Errors raised while binding partitions to boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BoundaryError {
    #[error("isolation level {0} is not supported")]
    InvalidLevel(u8),
    #[error("{0} named resources exceed the limit of {max}", max = MAX_NAMED_RESOURCES)]
    TooManyResources(usize),
    #[error("partition {partition} references unknown resource {resource:?}")]
    UnknownResource { partition: PartitionId, resource: String },
    #[error("partition {0} is already bound")]
    AlreadyBound(PartitionId),
}

/// Platform isolation level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
#[repr(u8)]
pub enum IsolationLevel {
    /// SPM and secure partitions share one privileged boundary.
    Level1 = 1,
    /// PSA-RoT and App-RoT are separated.
    Level2 = 2,
    /// Additionally, every partition is isolated from every other.
    Level3 = 3,
}

impl TryFrom<u8> for IsolationLevel {
    type Error = BoundaryError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(Self::Level1),
            2 => Ok(Self::Level2),
            3 => Ok(Self::Level3),
            other => Err(BoundaryError::InvalidLevel(other)),
        }
    }
}

/// Root-of-trust class of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotClass {
    PsaRot,
    AppRot,
}

/// Opaque encoding of a partition's isolation domain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BoundaryToken(u32);

impl BoundaryToken {
    const fn encode(privileged: bool, non_secure: bool, level: IsolationLevel, resources: u16) -> Self {
        let mut raw = (level as u32) << LEVEL_SHIFT;
        if privileged {
            raw |= PRIV_BIT;
        }
        if non_secure {
            raw |= NS_BIT;
        }
        raw |= (resources as u32) << RESOURCE_SHIFT;
        Self(raw)
    }

    pub(crate) const fn is_privileged(self) -> bool {
        self.0 & PRIV_BIT != 0
    }

    pub(crate) const fn is_non_secure(self) -> bool {
        self.0 & NS_BIT != 0
    }

    pub(crate) const fn level_bits(self) -> u32 {
        (self.0 & LEVEL_MASK) >> LEVEL_SHIFT
    }

    pub(crate) const fn resource_mask(self) -> u16 {
        (self.0 >> RESOURCE_SHIFT) as u16
    }

    pub(crate) const fn allows_resource(self, index: u8) -> bool {
        (index as usize) < MAX_NAMED_RESOURCES && self.resource_mask() & (1 << index) != 0
    }

    /// Token for tests that need a boundary without a manager.
    #[cfg(test)]
    pub(crate) const fn for_test(privileged: bool, non_secure: bool, resources: u16) -> Self {
        Self::encode(privileged, non_secure, IsolationLevel::Level2, resources)
    }
}

impl fmt::Debug for BoundaryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BoundaryToken(priv={} ns={} level={} res={:#06x})",
            self.is_privileged(),
            self.is_non_secure(),
            self.level_bits(),
            self.resource_mask()
        )
    }
}

/// Static description of a secure partition, as provided by the platform manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    pub name: String,
    pub rot: RotClass,
    /// Proxies calls from the non-secure world.
    pub ns_agent: bool,
    pub priority: Priority,
    pub stack: Region,
    pub entry: u32,
    /// Named resources (peripherals) the partition may touch.
    pub mmio: Vec<String>,
    /// Services the partition may call.
    pub dependencies: Vec<Sid>,
}

impl PartitionDescriptor {
    pub fn new(id: PartitionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            rot: RotClass::AppRot,
            ns_agent: false,
            priority: Priority::Normal,
            stack: Region::new(0, 0),
            entry: 0,
            mmio: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn rot(mut self, rot: RotClass) -> Self {
        self.rot = rot;
        self
    }

    pub fn ns_agent(mut self) -> Self {
        self.ns_agent = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack(mut self, stack: Region) -> Self {
        self.stack = stack;
        self
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    pub fn mmio(mut self, resource: impl Into<String>) -> Self {
        self.mmio.push(resource.into());
        self
    }

    pub fn depends_on(mut self, sid: Sid) -> Self {
        self.dependencies.push(sid);
        self
    }
}

/// Computes and caches boundary tokens and applies them to the processor.
pub struct BoundaryManager {
    level: IsolationLevel,
    resources: Vec<String>,
    bindings: Vec<(PartitionId, BoundaryToken)>,
}

impl BoundaryManager {
    /// Creates a manager for `level` with the platform's named-resource table.
    pub fn new(level: IsolationLevel, resources: Vec<String>) -> Result<Self, BoundaryError> {
        if resources.len() > MAX_NAMED_RESOURCES {
            return Err(BoundaryError::TooManyResources(resources.len()));
        }
        Ok(Self { level, resources, bindings: Vec::new() })
    }

    pub const fn level(&self) -> IsolationLevel {
        self.level
    }

    /// Bit index of a named resource.
    pub fn resource_index(&self, name: &str) -> Option<u8> {
        self.resources.iter().position(|r| r == name).map(|idx| idx as u8)
    }

    /// Derives the token for `desc` and caches it.
    pub fn bind(&mut self, desc: &PartitionDescriptor) -> Result<BoundaryToken, BoundaryError> {
        if self.token_of(desc.id).is_some() {
            return Err(BoundaryError::AlreadyBound(desc.id));
        }
        let mut mask = 0u16;
        for resource in &desc.mmio {
            let idx = self.resource_index(resource).ok_or_else(|| BoundaryError::UnknownResource {
                partition: desc.id,
                resource: resource.clone(),
            })?;
            mask |= 1 << idx;
        }
        let privileged = !desc.ns_agent
            && match self.level {
                IsolationLevel::Level1 => true,
                IsolationLevel::Level2 | IsolationLevel::Level3 => desc.rot == RotClass::PsaRot,
            };
        let token = BoundaryToken::encode(privileged, desc.ns_agent, self.level, mask);
        log::debug!(
            target: "spm::boundary",
            "bind partition={} name={} token={:?}",
            desc.id,
            desc.name,
            token
        );
        self.bindings.push((desc.id, token));
        Ok(token)
    }

    /// Cached token of a bound partition.
    pub fn token_of(&self, id: PartitionId) -> Option<BoundaryToken> {
        self.bindings.iter().find(|(pid, _)| *pid == id).map(|(_, token)| *token)
    }

    /// Applies `token` to the processor before `id` runs.
    ///
    /// A token that differs from the cached binding means the scheduler's view was
    /// corrupted; that is fatal.
    pub fn activate<A: ArchOps>(&self, arch: &mut A, id: PartitionId, token: BoundaryToken) {
        match self.token_of(id) {
            Some(bound) if bound == token => {}
            _ => fatal(Fatal::BoundaryMismatch(id)),
        }
        arch.set_privileged(token.is_privileged());
        arch.enable_named_regions(token.resource_mask());
        log::trace!(target: "spm::boundary", "activate partition={} token={:?}", id, token);
    }
}

/// Whether moving from `from` to `to` requires reprogramming the processor.
///
/// Identical tokens never need a switch, and neither do two privileged boundaries.
pub fn needs_switch(from: BoundaryToken, to: BoundaryToken) -> bool {
    !(from == to || (from.is_privileged() && to.is_privileged()))
}

/// Brings the named-region enables in line with `to` when [`needs_switch`] kept the privilege
/// state. Returns whether the processor was touched.
pub fn reload_named_regions<A: ArchOps>(arch: &mut A, from: BoundaryToken, to: BoundaryToken) -> bool {
    if from.resource_mask() == to.resource_mask() {
        return false;
    }
    arch.enable_named_regions(to.resource_mask());
    true
}

#[cfg(test)]
mod tests_prop;
