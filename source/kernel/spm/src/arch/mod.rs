// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture seam (privilege, stack registers, context switch pend) and scheduler lock
//! OWNERS: @spm-team
//! PUBLIC API: ArchOps, SchedLock/LockState/RescheduleOutcome, ThreadContext, init_context,
//!             refresh_hardware_context, Fatal, fatal()
//! DEPENDS_ON: mem::MemoryBus, types::Region
//! INVARIANTS: A context switch is never taken while the scheduler lock is held; a switch requested
//!             under the lock fires exactly once on release; a new thread always has a full frame

use core::fmt;

use thiserror::Error;

use crate::mem::MemoryBus;
use crate::types::{PartitionId, Region};

pub mod armv8m;
pub mod host;

pub use armv8m::CortexM;
pub use host::HostArch;

/// Conditions the SPM cannot recover from. Reaching one halts the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("fault injection detected")]
    FaultInjection,
    #[error("stack {0} too small for an initial context frame")]
    StackTooSmall(Region),
    #[error("stack {0} is not backed by memory")]
    StackUnbacked(Region),
    #[error("boundary of partition {0} does not match its binding")]
    BoundaryMismatch(PartitionId),
    #[error("scheduler lock misuse: {0}")]
    SchedLock(&'static str),
    #[error("reply write-back to {0:#010x} failed")]
    ReplyWriteBack(u32),
}

/// Logs `reason` and halts.
#[cold]
#[track_caller]
pub fn fatal(reason: Fatal) -> ! {
    log::error!(target: "spm::arch", "fatal: {}", reason);
    panic!("spm fatal: {}", reason)
}

/// Operations the SPM needs from the processor.
pub trait ArchOps {
    /// Drops to (or raises back from) unprivileged thread mode for the next thread.
    fn set_privileged(&mut self, privileged: bool);

    /// Current thread-mode privilege.
    fn is_privileged(&self) -> bool;

    /// Enables the protection regions of the named resources in `mask` and disables the rest.
    fn enable_named_regions(&mut self, mask: u16);

    /// Loads the process stack pointer.
    fn set_psp(&mut self, sp: u32);

    /// Loads the process stack limit.
    fn set_psplim(&mut self, limit: u32);

    /// Pends the context-switch exception.
    fn pend_context_switch(&mut self);
}

/// Scheduler lock states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    /// Locked, and a switch was requested meanwhile.
    AttemptedWhileLocked,
}

/// What happened to a reschedule request.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RescheduleOutcome {
    Pended,
    Deferred,
}

/// Non-reentrant lock that defers context switches.
///
/// Guards multi-step updates of connection state so a context switch cannot observe them
/// half-done.
#[derive(Debug)]
pub struct SchedLock {
    state: LockState,
}

impl Default for SchedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedLock {
    pub const fn new() -> Self {
        Self { state: LockState::Unlocked }
    }

    pub const fn state(&self) -> LockState {
        self.state
    }

    /// Acquires the lock. Nesting is a fatal error.
    pub fn lock(&mut self) {
        if self.state != LockState::Unlocked {
            fatal(Fatal::SchedLock("nested acquire"));
        }
        self.state = LockState::Locked;
    }

    /// Pends a switch now, or records it for release when the lock is held.
    pub fn request_reschedule<A: ArchOps>(&mut self, arch: &mut A) -> RescheduleOutcome {
        match self.state {
            LockState::Unlocked => {
                arch.pend_context_switch();
                RescheduleOutcome::Pended
            }
            LockState::Locked | LockState::AttemptedWhileLocked => {
                self.state = LockState::AttemptedWhileLocked;
                RescheduleOutcome::Deferred
            }
        }
    }

    /// Releases the lock and fires a deferred switch. Returns whether one fired.
    pub fn unlock<A: ArchOps>(&mut self, arch: &mut A) -> bool {
        match self.state {
            LockState::Locked => {
                self.state = LockState::Unlocked;
                false
            }
            LockState::AttemptedWhileLocked => {
                self.state = LockState::Unlocked;
                arch.pend_context_switch();
                true
            }
            LockState::Unlocked => fatal(Fatal::SchedLock("release without acquire")),
        }
    }
}

/// Bytes reserved for r4-r11 above the hardware exception frame.
const CALLEE_SAVED_BYTES: u32 = 8 * 4;
/// r0-r3, r12, lr, pc, xPSR.
const EXCEPTION_FRAME_BYTES: u32 = 8 * 4;
/// Full initial frame pushed on a fresh thread stack.
pub const CONTEXT_FRAME_SIZE: u32 = CALLEE_SAVED_BYTES + EXCEPTION_FRAME_BYTES;
/// Stack alignment required at exception entry.
pub const STACK_ALIGN: u32 = 8;
/// Return to secure thread mode on the process stack, basic frame.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;
const XPSR_THUMB: u32 = 1 << 24;
/// Return address of a thread entry function; faults if the entry ever returns.
const LR_TRAP: u32 = 0xFFFF_FFFF;

/// Saved per-thread processor state the switch path needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadContext {
    sp: u32,
    sp_limit: u32,
    exc_return: u32,
}

impl ThreadContext {
    pub const fn sp(&self) -> u32 {
        self.sp
    }

    pub const fn sp_limit(&self) -> u32 {
        self.sp_limit
    }

    pub const fn exc_return(&self) -> u32 {
        self.exc_return
    }

    /// Records where the switch handler left the thread's stack.
    pub fn set_sp(&mut self, sp: u32) {
        self.sp = sp;
    }
}

impl fmt::Display for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp={:#010x} lim={:#010x} exc={:#010x}", self.sp, self.sp_limit, self.exc_return)
    }
}

/// Lays out the initial frame for a thread that starts at `entry` with `arg` in r0.
///
/// The frame is placed at the 8-byte aligned top of `stack`. A stack that cannot hold the
/// frame is fatal.
pub fn init_context<M: MemoryBus>(mem: &mut M, stack: Region, entry: u32, arg: u32) -> ThreadContext {
    let top = stack.end().min(1u64 << 32) & !(STACK_ALIGN as u64 - 1);
    let base = stack.base() as u64;
    if top < base + CONTEXT_FRAME_SIZE as u64 {
        fatal(Fatal::StackTooSmall(stack));
    }
    let sp = (top - CONTEXT_FRAME_SIZE as u64) as u32;

    let mut words = [0u32; (CONTEXT_FRAME_SIZE / 4) as usize];
    // r4-r11 stay zero; the hardware frame follows.
    let hw = &mut words[(CALLEE_SAVED_BYTES / 4) as usize..];
    hw[0] = arg;
    hw[5] = LR_TRAP;
    hw[6] = entry | 1;
    hw[7] = XPSR_THUMB;

    let mut frame = [0u8; CONTEXT_FRAME_SIZE as usize];
    for (chunk, word) in frame.chunks_exact_mut(4).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    if mem.write(sp, &frame).is_err() {
        fatal(Fatal::StackUnbacked(stack));
    }
    log::trace!(target: "spm::arch", "init_context stack={} sp={:#010x}", stack, sp);
    ThreadContext { sp, sp_limit: stack.base(), exc_return: EXC_RETURN_THREAD_PSP }
}

/// Loads `ctx` into the stack registers and returns the exception-return value to use.
pub fn refresh_hardware_context<A: ArchOps>(arch: &mut A, ctx: &ThreadContext) -> u32 {
    // Limit first: the outgoing limit may sit above the incoming stack pointer.
    arch.set_psplim(0);
    arch.set_psp(ctx.sp);
    arch.set_psplim(ctx.sp_limit);
    ctx.exc_return
}
