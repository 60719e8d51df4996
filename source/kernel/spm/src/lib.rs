// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Secure Partition Manager call path
//! OWNERS: @spm-team
//! PUBLIC API: Spm (connect/call/close/version + get/read/skip/write/reply + schedule),
//!             isolation::memory_check, boundary::BoundaryManager, iovec::marshal,
//!             conn::ConnectionManager, arch::{SchedLock, ArchOps}, ipc::Router
//! DEPENDS_ON: psa-abi, bitflags, spin, log, thiserror, serde
//! INVARIANTS: Every byte range shared with a partition is validated against the right boundary
//!             before use; descriptor arrays are copied before validation results are used;
//!             connection state only moves forward; fatal conditions halt instead of degrading

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod arch;
pub mod boundary;
pub mod config;
pub mod conn;
pub mod diag;
pub mod fih;
pub mod iovec;
pub mod ipc;
pub mod isolation;
pub mod mem;
pub mod sched;
pub mod service;
pub mod spm;
pub mod types;

pub use spm::{Caller, Completion, MessageInfo, Pending, SetupError, Spm, SpmError, SwitchInfo};
pub use types::{PartitionId, Region};
