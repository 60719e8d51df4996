// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for boundary switch decisions
//! OWNERS: @spm-team
//! NOTE: Tests only; no SPM logic.
//!
//! TEST_SCOPE:
//!   - Staying on the same boundary never reprograms the processor
//!   - Every transition leaves the processor in the incoming boundary's state
//!
//! TEST_SCENARIOS:
//!   - same_boundary_never_switches(): needs_switch(b, b) is false for any token
//!   - switch_decision_is_symmetric(): needs_switch(a, b) == needs_switch(b, a)
//!   - transitions_reach_target_state(): activate-or-reload ends with the target's privilege and mask

use super::{needs_switch, reload_named_regions, BoundaryToken, IsolationLevel};
use crate::arch::{ArchOps, HostArch};
use proptest::prelude::*;

fn arb_level() -> impl Strategy<Value = IsolationLevel> {
    prop_oneof![Just(IsolationLevel::Level1), Just(IsolationLevel::Level2), Just(IsolationLevel::Level3)]
}

fn arb_token() -> impl Strategy<Value = BoundaryToken> {
    (any::<bool>(), any::<bool>(), arb_level(), any::<u16>())
        .prop_map(|(privileged, ns, level, res)| BoundaryToken::encode(privileged, ns, level, res))
}

fn apply<A: ArchOps>(arch: &mut A, token: BoundaryToken) {
    arch.set_privileged(token.is_privileged());
    arch.enable_named_regions(token.resource_mask());
}

proptest! {
    #[test]
    fn same_boundary_never_switches(token in arb_token()) {
        prop_assert!(!needs_switch(token, token));
    }

    #[test]
    fn switch_decision_is_symmetric(a in arb_token(), b in arb_token()) {
        prop_assert_eq!(needs_switch(a, b), needs_switch(b, a));
    }

    #[test]
    fn transitions_reach_target_state(from in arb_token(), to in arb_token()) {
        let mut arch = HostArch::new();
        apply(&mut arch, from);
        if needs_switch(from, to) {
            apply(&mut arch, to);
        } else {
            reload_named_regions(&mut arch, from, to);
        }
        prop_assert_eq!(arch.is_privileged(), to.is_privileged());
        prop_assert_eq!(arch.named_regions(), to.resource_mask());
    }
}
