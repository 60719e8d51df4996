// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the memory isolation checker
//! OWNERS: @spm-team
//! NOTE: Tests only; no SPM logic.
//!
//! TEST_SCOPE:
//!   - Allowed ranges are fully contained in one region
//!   - Write access never granted on read-only or privileged-only regions to the wrong boundary
//!
//! TEST_SCENARIOS:
//!   - allowed_implies_containment(): every allowed non-empty range lies inside a table region
//!   - unprivileged_never_reaches_privileged_only(): no range inside privileged RAM is allowed
//!   - read_write_needs_write_attr(): read-write on read-only code is always denied
//!   - empty_ranges_always_allowed(): len == 0 is allowed for every base and boundary

use super::{check_verified, AccessFlags, RegionTable};
use crate::boundary::BoundaryToken;
use crate::types::Region;
use proptest::prelude::*;

fn arb_boundary() -> impl Strategy<Value = BoundaryToken> {
    (any::<bool>(), any::<bool>(), any::<u16>())
        .prop_map(|(privileged, ns, res)| BoundaryToken::for_test(privileged, ns, res))
}

fn arb_access() -> impl Strategy<Value = AccessFlags> {
    (0u32..8).prop_map(AccessFlags::from_bits_truncate)
}

fn table() -> RegionTable {
    super::tests::table()
}

const REGIONS: [Region; 5] = [
    Region::new(0x3000_0000, 0x1_0000),
    Region::new(0x3100_0000, 0x1_0000),
    Region::new(0x1000_0000, 0x1_0000),
    Region::new(0x2000_0000, 0x1_0000),
    Region::new(0x5000_0000, 0x1000),
];

proptest! {
    #[test]
    fn allowed_implies_containment(
        boundary in arb_boundary(),
        access in arb_access(),
        base in prop_oneof![0x2fff_ff00u32..0x3001_0100, 0x0fff_ff00u32..0x1001_0100, any::<u32>()],
        len in 1u32..0x2000,
    ) {
        let t = table();
        if check_verified(&t, boundary, base, len, access).is_ok() {
            let range = Region::new(base, len);
            prop_assert!(REGIONS.iter().any(|r| r.contains(range)));
        }
    }

    #[test]
    fn unprivileged_never_reaches_privileged_only(
        ns in any::<bool>(),
        res in any::<u16>(),
        access in arb_access(),
        offset in 0u32..0x1_0000,
        len in 1u32..0x100,
    ) {
        let t = table();
        let boundary = BoundaryToken::for_test(false, ns, res);
        prop_assert!(check_verified(&t, boundary, 0x3100_0000 + offset, len, access).is_err());
    }

    #[test]
    fn read_write_needs_write_attr(
        boundary in arb_boundary(),
        ns in any::<bool>(),
        offset in 0u32..0x1_0000,
        len in 1u32..0x100,
    ) {
        let t = table();
        prop_assert!(check_verified(&t, boundary, 0x1000_0000 + offset, len, AccessFlags::read_write(ns)).is_err());
    }

    #[test]
    fn empty_ranges_always_allowed(boundary in arb_boundary(), access in arb_access(), base in any::<u32>()) {
        let t = table();
        prop_assert!(check_verified(&t, boundary, base, 0, access).is_ok());
    }
}
