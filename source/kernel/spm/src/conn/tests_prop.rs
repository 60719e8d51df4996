// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the connection arenas
//! OWNERS: @spm-team
//! NOTE: Tests only; no SPM logic.
//!
//! TEST_SCOPE:
//!   - Stateless leases stay exclusive per service index under arbitrary lease/free sequences
//!   - Freed session handles never resolve again
//!
//! TEST_SCENARIOS:
//!   - leases_stay_exclusive(): live stateless connections never share a service index
//!   - freed_handles_stay_dead(): every handle freed during a run is rejected afterwards

use alloc::vec::Vec;

use super::{ConnError, ConnId, Connection, ConnectionManager};
use crate::boundary::BoundaryToken;
use crate::types::PartitionId;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Lease(u8),
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..4).prop_map(Op::Lease), (0usize..8).prop_map(Op::Free)]
}

fn conn() -> Connection {
    Connection::new(0x40, PartitionId::from_raw(1), 1, BoundaryToken::for_test(true, false, 0))
}

proptest! {
    #[test]
    fn leases_stay_exclusive(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let mut mgr = ConnectionManager::new(3, 1);
        let mut live: Vec<(u8, ConnId)> = Vec::new();
        for op in ops {
            match op {
                Op::Lease(index) => match mgr.lease_stateless(index, conn()) {
                    Ok(id) => {
                        prop_assert!(live.iter().all(|(i, _)| *i != index));
                        live.push((index, id));
                    }
                    Err(ConnError::Busy) => prop_assert!(live.iter().any(|(i, _)| *i == index)),
                    Err(ConnError::Exhausted) => prop_assert_eq!(live.len(), 3),
                    Err(other) => prop_assert!(false, "unexpected {:?}", other),
                },
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (_, id) = live.remove(pick % live.len());
                        prop_assert!(mgr.free_connection(id).is_ok());
                    }
                }
            }
            prop_assert_eq!(mgr.live_stateless(), live.len());
        }
    }

    #[test]
    fn freed_handles_stay_dead(rounds in 1usize..40, keep in 0usize..3) {
        let mut mgr = ConnectionManager::new(1, 3);
        let mut dead = Vec::new();
        let mut held = Vec::new();
        for round in 0..rounds {
            let id = mgr.open_session(conn()).unwrap();
            let handle = mgr.session_handle(id).unwrap();
            if held.len() < keep {
                held.push(handle);
            } else {
                mgr.free_connection(id).unwrap();
                dead.push(handle);
            }
            for stale in &dead {
                prop_assert_eq!(mgr.session(*stale, 1), Err(ConnError::NotFound), "round {}", round);
            }
            for live in &held {
                prop_assert!(mgr.session(*live, 1).is_ok());
            }
        }
    }
}
