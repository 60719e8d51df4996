// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared across the SPM (partition ids, address ranges)
//! OWNERS: @spm-team
//! PUBLIC API: PartitionId, Region
//! INVARIANTS: Region ends are computed in u64 so `base + len` never wraps

use core::fmt;

use psa_abi::ClientId;
use serde::Deserialize;

/// Secure partition identifier.
///
/// **Invariant**: secure partition ids are positive; they double as the client id the
/// partition presents when it calls another service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a partition id from its raw value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Client id used when this partition acts as a secure client.
    #[inline]
    pub const fn client_id(self) -> ClientId {
        self.0 as ClientId
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open byte range `[base, base + len)` in the 32-bit physical address map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    base: u32,
    len: u32,
}

impl Region {
    #[inline]
    pub const fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }

    #[inline]
    pub const fn base(self) -> u32 {
        self.base
    }

    #[inline]
    pub const fn len(self) -> u32 {
        self.len
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Exclusive end. May be `1 << 32` for a range touching the top of the map.
    #[inline]
    pub const fn end(self) -> u64 {
        self.base as u64 + self.len as u64
    }

    /// True when the range does not run past the 32-bit address map.
    #[inline]
    pub const fn fits_address_map(self) -> bool {
        self.end() <= 1u64 << 32
    }

    /// True when `other` lies entirely inside `self`.
    #[inline]
    pub const fn contains(self, other: Region) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// True when both ranges are non-empty and share at least one byte.
    #[inline]
    pub const fn overlaps(self, other: Region) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        (self.base as u64) < other.end() && (other.base as u64) < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}, {:#x})", self.base, self.end())
    }
}
