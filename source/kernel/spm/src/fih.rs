// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault-injection-hardened decision values for security checks
//! OWNERS: @spm-team
//! PUBLIC API: FihStatus (into_result), Verdict, call_and_verify
//! DEPENDS_ON: arch::fatal
//! INVARIANTS: A FihStatus is only built from two agreeing witnesses; every read re-validates
//!             its encoding; disagreement or corruption halts the system
//!
//! A single flipped branch must not turn "deny" into "allow". Decisions therefore never
//! travel as `bool`: they travel as [`FihStatus`], whose value and complement are stored
//! separately and checked on every use, and whose producers are called twice.

use core::hint::black_box;

use thiserror::Error;

use crate::arch::{fatal, Fatal};

const FIH_MASK: u32 = 0xA5C3_5A3C;
const FIH_SUCCESS: u32 = 0x3C5A_C3A5;
const FIH_FAILURE: u32 = 0x0AC3_5CF0;

/// Decision computed by one independent evaluation path.
///
/// Encoded with multi-bit patterns so that a single-bit fault lands on neither value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Verdict {
    Allow = 0x5AA5_C33C,
    Deny = 0x0F0F_F0F0,
}

/// Access denied by a hardened check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("access denied")]
pub struct Denied;

/// Hardened allow/deny decision.
///
/// There is deliberately no `PartialEq`, no `From<bool>` and no `bool` accessor: the
/// only way to consume the decision is [`FihStatus::into_result`].
#[derive(Clone, Copy)]
#[must_use = "a hardened decision must be consumed with into_result"]
pub struct FihStatus {
    val: u32,
    msk: u32,
}

impl FihStatus {
    const fn encode(val: u32) -> Self {
        Self { val, msk: val ^ FIH_MASK }
    }

    /// Combines two independently computed witnesses. Disagreement is a detected fault.
    pub fn from_witnesses(first: Verdict, second: Verdict) -> Self {
        let first = black_box(first);
        let second = black_box(second);
        match (first, second) {
            (Verdict::Allow, Verdict::Allow) => Self::encode(FIH_SUCCESS),
            (Verdict::Deny, Verdict::Deny) => Self::encode(FIH_FAILURE),
            _ => fatal(Fatal::FaultInjection),
        }
    }

    /// Shorthand for two agreeing deny witnesses.
    pub fn deny() -> Self {
        Self::encode(FIH_FAILURE)
    }

    fn validated(self) -> u32 {
        let val = black_box(self.val);
        if val ^ black_box(self.msk) != FIH_MASK {
            fatal(Fatal::FaultInjection);
        }
        val
    }

    /// Consumes the decision.
    pub fn into_result(self) -> Result<(), Denied> {
        match self.validated() {
            FIH_SUCCESS => {
                // Second read: a skipped comparison above must not fall through to Ok.
                if black_box(self.val) != FIH_SUCCESS {
                    fatal(Fatal::FaultInjection);
                }
                Ok(())
            }
            FIH_FAILURE => Err(Denied),
            _ => fatal(Fatal::FaultInjection),
        }
    }

    fn same_as(self, other: Self) -> bool {
        self.validated() == other.validated()
    }
}

impl core::fmt::Debug for FihStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.val {
            FIH_SUCCESS => f.write_str("FihStatus(allow)"),
            FIH_FAILURE => f.write_str("FihStatus(deny)"),
            other => write!(f, "FihStatus(corrupt {other:#010x})"),
        }
    }
}

/// Evaluates `check` twice and halts when the two evaluations disagree.
pub fn call_and_verify<F>(check: F) -> FihStatus
where
    F: Fn() -> FihStatus,
{
    let first = check();
    let second = black_box(&check)();
    if !first.same_as(second) {
        fatal(Fatal::FaultInjection);
    }
    first
}
