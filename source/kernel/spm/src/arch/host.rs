// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recording processor used by host builds and tests.

use super::ArchOps;

/// Register file of a simulated core; every operation is recorded for inspection.
#[derive(Clone, Debug)]
pub struct HostArch {
    privileged: bool,
    named_regions: u16,
    psp: u32,
    psplim: u32,
    pending_switches: u32,
}

impl Default for HostArch {
    fn default() -> Self {
        Self::new()
    }
}

impl HostArch {
    /// A core fresh out of reset: privileged, nothing pended.
    pub const fn new() -> Self {
        Self {
            privileged: true,
            named_regions: 0,
            psp: 0,
            psplim: 0,
            pending_switches: 0,
        }
    }

    pub const fn named_regions(&self) -> u16 {
        self.named_regions
    }

    pub const fn psp(&self) -> u32 {
        self.psp
    }

    pub const fn psplim(&self) -> u32 {
        self.psplim
    }

    /// Context switches pended so far.
    pub const fn pending_switches(&self) -> u32 {
        self.pending_switches
    }
}

impl ArchOps for HostArch {
    fn set_privileged(&mut self, privileged: bool) {
        self.privileged = privileged;
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn enable_named_regions(&mut self, mask: u16) {
        self.named_regions = mask;
    }

    fn set_psp(&mut self, sp: u32) {
        self.psp = sp;
    }

    fn set_psplim(&mut self, limit: u32) {
        self.psplim = limit;
    }

    fn pend_context_switch(&mut self) {
        self.pending_switches += 1;
    }
}
