// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for vector marshalling
//! OWNERS: @spm-team
//! NOTE: Tests only; no SPM logic.
//!
//! TEST_SCOPE:
//!   - Accepted vector sets are pairwise disjoint and inside caller-accessible memory
//!   - Any overlap between two non-empty vectors is rejected, whatever their direction
//!
//! TEST_SCENARIOS:
//!   - accepted_sets_are_disjoint(): random vectors either fail or satisfy the invariants
//!   - any_overlap_is_rejected(): a forced overlap between vector i and vector j always fails

use alloc::vec::Vec;

use super::tests::{fixture, unprivileged_conn, write_descs, RAM};
use super::{marshal, MarshalError};
use crate::types::Region;
use psa_abi::{ControlWord, PSA_MAX_IOVEC};
use proptest::prelude::*;

const IN_DESC: u32 = 0x3000_0000;
const OUT_DESC: u32 = 0x3000_0040;
const BUFFERS: u32 = 0x3000_0100;

fn arb_vecs() -> impl Strategy<Value = (usize, Vec<(u32, u32)>)> {
    (0usize..=PSA_MAX_IOVEC).prop_flat_map(|total| {
        (
            0..=total,
            proptest::collection::vec((0u32..0x100, 0u32..0x40), total).prop_map(|v| {
                v.into_iter().map(|(off, len)| (BUFFERS + off, len)).collect::<Vec<_>>()
            }),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig { max_global_rejects: 16384, ..ProptestConfig::default() })]

    #[test]
    fn accepted_sets_are_disjoint((in_len, vecs) in arb_vecs()) {
        let mut f = fixture();
        write_descs(&mut f.mem, IN_DESC, &vecs[..in_len]);
        write_descs(&mut f.mem, OUT_DESC, &vecs[in_len..]);
        let ctrl = ControlWord::builder().inputs(in_len).outputs(vecs.len() - in_len).build().unwrap();
        let id = unprivileged_conn(&mut f);
        let conn = f.conns.get_mut(id).unwrap();
        if marshal(conn, &ctrl, IN_DESC, OUT_DESC, &f.table, &f.mem).is_ok() {
            let set = conn.vectors();
            let all: Vec<Region> = set
                .inputs()
                .iter()
                .chain(set.outputs())
                .map(|v| Region::new(v.base(), v.len()))
                .collect();
            for (i, a) in all.iter().enumerate() {
                prop_assert!(a.is_empty() || RAM.contains(*a));
                for b in &all[i + 1..] {
                    prop_assert!(!a.overlaps(*b));
                }
            }
        }
    }

    #[test]
    fn any_overlap_is_rejected(in_len in 0usize..=2, out_len in 0usize..=2, i in 0usize..4, j in 0usize..4, shift in 0u32..8) {
        let total = in_len + out_len;
        prop_assume!(total >= 2 && i < total && j < total && i != j);
        let mut vecs: Vec<(u32, u32)> = (0..total).map(|k| (BUFFERS + 0x40 * k as u32, 16)).collect();
        vecs[j] = (vecs[i].0 + shift, 16);
        let mut f = fixture();
        write_descs(&mut f.mem, IN_DESC, &vecs[..in_len]);
        write_descs(&mut f.mem, OUT_DESC, &vecs[in_len..]);
        let ctrl = ControlWord::builder().inputs(in_len).outputs(out_len).build().unwrap();
        let id = unprivileged_conn(&mut f);
        let conn = f.conns.get_mut(id).unwrap();
        prop_assert!(matches!(
            marshal(conn, &ctrl, IN_DESC, OUT_DESC, &f.table, &f.mem),
            Err(MarshalError::Overlap(_, _))
        ));
    }
}
