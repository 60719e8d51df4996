// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory isolation checker for partition-supplied address ranges
//! OWNERS: @spm-team
//! PUBLIC API: AccessFlags, RegionAttrs, RegionDescriptor, RegionTable, memory_check, check_verified
//! DEPENDS_ON: boundary::BoundaryToken, fih
//! INVARIANTS: A range is allowed only if one region contains all of it; the decision is computed
//!             by two independent evaluation paths; zero-length ranges are always allowed
//!
//! Every range handed to the SPM by a partition (descriptor arrays, vector buffers, service
//! buffers) passes through [`check_verified`] against the boundary of the partition that
//! owns the range before the SPM touches it.

use alloc::vec::Vec;

use bitflags::bitflags;
use thiserror::Error;

use crate::boundary::BoundaryToken;
use crate::fih::{self, Denied, FihStatus, Verdict};
use crate::types::Region;

#[cfg(test)]
mod tests_prop;

bitflags! {
    /// Access a caller wants to perform.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The range is expected in non-secure memory.
        const NON_SECURE = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl AccessFlags {
    /// Read access, in the non-secure domain when `ns` is set.
    pub fn read(ns: bool) -> Self {
        let mut flags = Self::READ;
        flags.set(Self::NON_SECURE, ns);
        flags
    }

    /// Read/write access, in the non-secure domain when `ns` is set.
    pub fn read_write(ns: bool) -> Self {
        let mut flags = Self::READ_WRITE;
        flags.set(Self::NON_SECURE, ns);
        flags
    }
}

bitflags! {
    /// Attributes of a platform memory region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionAttrs: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Reachable from unprivileged boundaries.
        const UNPRIV = 1 << 2;
        const NON_SECURE = 1 << 3;
        /// Peripheral region gated by a named-resource bit.
        const NAMED = 1 << 4;
    }
}

/// Errors raised while building the region table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("region {0} overlaps an existing region")]
    Overlap(Region),
    #[error("region {0} runs past the address map")]
    OutOfRange(Region),
    #[error("named region {0} has no resource index")]
    MissingResource(Region),
}

/// One entry of the platform region table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionDescriptor {
    region: Region,
    attrs: RegionAttrs,
    resource: Option<u8>,
}

impl RegionDescriptor {
    pub const fn new(region: Region, attrs: RegionAttrs) -> Self {
        Self { region, attrs, resource: None }
    }

    /// Gates the region behind named resource `index`.
    pub fn named(mut self, index: u8) -> Self {
        self.attrs |= RegionAttrs::NAMED;
        self.resource = Some(index);
        self
    }

    pub const fn region(&self) -> Region {
        self.region
    }

    pub const fn attrs(&self) -> RegionAttrs {
        self.attrs
    }
}

/// Platform memory map consulted by [`memory_check`].
#[derive(Clone, Debug, Default)]
pub struct RegionTable {
    entries: Vec<RegionDescriptor>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region. Regions never overlap, so at most one can contain a given byte.
    pub fn add(&mut self, desc: RegionDescriptor) -> Result<(), RegionError> {
        if desc.region.is_empty() || !desc.region.fits_address_map() {
            return Err(RegionError::OutOfRange(desc.region));
        }
        if desc.attrs.contains(RegionAttrs::NAMED) && desc.resource.is_none() {
            return Err(RegionError::MissingResource(desc.region));
        }
        if self.entries.iter().any(|e| e.region.overlaps(desc.region)) {
            return Err(RegionError::Overlap(desc.region));
        }
        self.entries.push(desc);
        Ok(())
    }

    /// The region containing all of `range`.
    fn lookup(&self, range: Region) -> Option<&RegionDescriptor> {
        self.entries.iter().find(|e| e.region.contains(range))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const fn verdict(allow: bool) -> Verdict {
    if allow {
        Verdict::Allow
    } else {
        Verdict::Deny
    }
}

fn wants_non_secure(boundary: BoundaryToken, access: AccessFlags) -> bool {
    boundary.is_non_secure() || access.contains(AccessFlags::NON_SECURE)
}

/// First path: build the attribute set the access needs and test containment.
fn attribute_cover(desc: &RegionDescriptor, boundary: BoundaryToken, access: AccessFlags) -> Verdict {
    let mut required = RegionAttrs::READ;
    if access.contains(AccessFlags::WRITE) {
        required |= RegionAttrs::WRITE;
    }
    if !boundary.is_privileged() {
        required |= RegionAttrs::UNPRIV;
    }
    let domain_ok = desc.attrs.contains(RegionAttrs::NON_SECURE) == wants_non_secure(boundary, access);
    let named_ok = !desc.attrs.contains(RegionAttrs::NAMED)
        || desc.resource.map_or(false, |idx| boundary.allows_resource(idx));
    verdict(desc.attrs.contains(required) && domain_ok && named_ok)
}

/// Second path: walk the deny rules one at a time.
fn rule_walk(desc: &RegionDescriptor, boundary: BoundaryToken, access: AccessFlags) -> Verdict {
    let attrs = desc.attrs;
    if !attrs.intersects(RegionAttrs::READ) {
        return Verdict::Deny;
    }
    if access.intersects(AccessFlags::WRITE) && !attrs.intersects(RegionAttrs::WRITE) {
        return Verdict::Deny;
    }
    if !boundary.is_privileged() && !attrs.intersects(RegionAttrs::UNPRIV) {
        return Verdict::Deny;
    }
    match (attrs.intersects(RegionAttrs::NON_SECURE), wants_non_secure(boundary, access)) {
        (true, true) | (false, false) => {}
        _ => return Verdict::Deny,
    }
    if attrs.intersects(RegionAttrs::NAMED) {
        match desc.resource {
            Some(idx) if boundary.allows_resource(idx) => {}
            _ => return Verdict::Deny,
        }
    }
    Verdict::Allow
}

/// Decides whether `boundary` may perform `access` on `[base, base + len)`.
pub fn memory_check(
    table: &RegionTable,
    boundary: BoundaryToken,
    base: u32,
    len: u32,
    access: AccessFlags,
) -> FihStatus {
    let range = Region::new(base, len);
    if range.is_empty() {
        return FihStatus::from_witnesses(Verdict::Allow, Verdict::Allow);
    }
    if !range.fits_address_map() {
        return FihStatus::deny();
    }
    let Some(desc) = table.lookup(range) else {
        return FihStatus::deny();
    };
    FihStatus::from_witnesses(
        attribute_cover(desc, boundary, access),
        rule_walk(desc, boundary, access),
    )
}

/// [`memory_check`] through the call-and-verify wrapper, consumed into a `Result`.
///
/// This is the only entry point the rest of the SPM uses.
pub fn check_verified(
    table: &RegionTable,
    boundary: BoundaryToken,
    base: u32,
    len: u32,
    access: AccessFlags,
) -> Result<(), Denied> {
    let result = fih::call_and_verify(|| memory_check(table, boundary, base, len, access)).into_result();
    if result.is_err() {
        log::warn!(
            target: "spm::isolation",
            "deny range={} access={:?} boundary={:?}",
            Region::new(base, len),
            access,
            boundary
        );
    }
    result
}
