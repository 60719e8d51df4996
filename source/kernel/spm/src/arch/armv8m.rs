// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Armv8-M Mainline helpers used by the SPM.
//!
//! Named-resource regions are programmed into MPU slots starting at
//! [`NAMED_REGION_FIRST_SLOT`] during platform bring-up; activation only toggles their
//! enable bits. Host builds compile the `#[cfg(not(target_arch = "arm"))]` stubs so the
//! high level logic can still be exercised.

use super::ArchOps;

/// First MPU slot holding a named-resource region.
pub const NAMED_REGION_FIRST_SLOT: u32 = 8;
/// Number of named-resource slots; one per resource the boundary layer can grant.
pub const NAMED_REGION_SLOTS: u32 = crate::boundary::MAX_NAMED_RESOURCES as u32;

static_assertions::const_assert!(NAMED_REGION_FIRST_SLOT + NAMED_REGION_SLOTS <= 16);

#[cfg(target_arch = "arm")]
const SCB_ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
#[cfg(target_arch = "arm")]
const ICSR_PENDSVSET: u32 = 1 << 28;
#[cfg(target_arch = "arm")]
const MPU_RNR: *mut u32 = 0xE000_ED98 as *mut u32;
#[cfg(target_arch = "arm")]
const MPU_RLAR: *mut u32 = 0xE000_EDA0 as *mut u32;
#[cfg(target_arch = "arm")]
const RLAR_EN: u32 = 1;

/// Zero-sized handle to the running core.
#[derive(Clone, Copy, Debug, Default)]
pub struct CortexM;

/// Writes `CONTROL.nPRIV`.
#[inline]
pub fn write_npriv(unprivileged: bool) {
    #[cfg(target_arch = "arm")]
    unsafe {
        let mut control: u32;
        core::arch::asm!("mrs {0}, CONTROL", out(reg) control, options(nomem, nostack, preserves_flags));
        if unprivileged {
            control |= 1;
        } else {
            control &= !1;
        }
        core::arch::asm!("msr CONTROL, {0}", "isb", in(reg) control, options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = unprivileged;
    }
}

/// Reads `CONTROL.nPRIV`.
#[inline]
pub fn read_npriv() -> bool {
    #[cfg(target_arch = "arm")]
    unsafe {
        let control: u32;
        core::arch::asm!("mrs {0}, CONTROL", out(reg) control, options(nomem, nostack, preserves_flags));
        control & 1 != 0
    }
    #[cfg(not(target_arch = "arm"))]
    {
        false
    }
}

/// Writes the process stack pointer.
#[inline]
pub fn write_psp(sp: u32) {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("msr psp, {0}", in(reg) sp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = sp;
    }
}

/// Writes the process stack limit.
#[inline]
pub fn write_psplim(limit: u32) {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("msr psplim, {0}", in(reg) limit, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = limit;
    }
}

/// Sets PendSV pending.
#[inline]
pub fn pend_sv() {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::ptr::write_volatile(SCB_ICSR, ICSR_PENDSVSET);
        core::arch::asm!("dsb", "isb", options(nomem, nostack, preserves_flags));
    }
}

/// Toggles the enable bit of each named-resource MPU slot according to `mask`.
#[inline]
pub fn write_named_regions(mask: u16) {
    #[cfg(target_arch = "arm")]
    unsafe {
        for idx in 0..NAMED_REGION_SLOTS {
            core::ptr::write_volatile(MPU_RNR, NAMED_REGION_FIRST_SLOT + idx);
            let rlar = core::ptr::read_volatile(MPU_RLAR);
            let rlar = if mask & (1 << idx) != 0 { rlar | RLAR_EN } else { rlar & !RLAR_EN };
            core::ptr::write_volatile(MPU_RLAR, rlar);
        }
        core::arch::asm!("dsb", "isb", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "arm"))]
    {
        let _ = mask;
    }
}

impl ArchOps for CortexM {
    fn set_privileged(&mut self, privileged: bool) {
        write_npriv(!privileged);
    }

    fn is_privileged(&self) -> bool {
        !read_npriv()
    }

    fn enable_named_regions(&mut self, mask: u16) {
        write_named_regions(mask);
    }

    fn set_psp(&mut self, sp: u32) {
        write_psp(sp);
    }

    fn set_psplim(&mut self, limit: u32) {
        write_psplim(limit);
    }

    fn pend_context_switch(&mut self) {
        pend_sv();
    }
}
