// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Byte-addressed view of partition memory used by the SPM
//! OWNERS: @spm-team
//! PUBLIC API: MemoryBus (read/write/read_u32/write_u32), SystemMemory (add_bank), BusError
//! INVARIANTS: Accesses never straddle two banks; banks never overlap
//!
//! The SPM never dereferences partition addresses directly. Every copy goes through a
//! [`MemoryBus`], which on hardware is a thin volatile-copy shim and on the host is a
//! set of RAM banks.

use alloc::vec;
use alloc::vec::Vec;

use thiserror::Error;

use crate::types::Region;

/// Failure to reach an address through the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BusError {
    /// No bank backs the requested range.
    #[error("no memory backs {0}")]
    Unmapped(Region),
    /// A new bank would overlap an existing one.
    #[error("bank {0} overlaps an existing bank")]
    Overlap(Region),
}

/// Byte-level access to the physical address map.
pub trait MemoryBus {
    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError>;

    /// Copies `data` to memory starting at `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), BusError>;

    /// Reads a little-endian word.
    fn read_u32(&self, addr: u32) -> Result<u32, BusError> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Writes a little-endian word.
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), BusError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Copies `len` bytes from `src` to `dst` through a bounce buffer.
    fn copy(&mut self, src: u32, dst: u32, len: u32) -> Result<(), BusError> {
        let mut bounce = [0u8; 64];
        let mut done = 0u32;
        while done < len {
            let chunk = (len - done).min(bounce.len() as u32);
            let buf = &mut bounce[..chunk as usize];
            self.read(src.wrapping_add(done), buf)?;
            self.write(dst.wrapping_add(done), buf)?;
            done += chunk;
        }
        Ok(())
    }
}

struct Bank {
    region: Region,
    data: Vec<u8>,
}

/// RAM banks backing a simulated address map.
#[derive(Default)]
pub struct SystemMemory {
    banks: Vec<Bank>,
}

impl SystemMemory {
    /// Creates an empty address map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zero-filled bank covering `region`.
    pub fn add_bank(&mut self, region: Region) -> Result<(), BusError> {
        if !region.fits_address_map() || self.banks.iter().any(|bank| bank.region.overlaps(region)) {
            return Err(BusError::Overlap(region));
        }
        self.banks.push(Bank { region, data: vec![0; region.len() as usize] });
        Ok(())
    }

    /// Builder form of [`SystemMemory::add_bank`].
    pub fn with_bank(mut self, region: Region) -> Result<Self, BusError> {
        self.add_bank(region)?;
        Ok(self)
    }

    fn locate(&self, range: Region) -> Result<(usize, usize), BusError> {
        self.banks
            .iter()
            .enumerate()
            .find(|(_, bank)| bank.region.contains(range))
            .map(|(idx, bank)| (idx, (range.base() - bank.region.base()) as usize))
            .ok_or(BusError::Unmapped(range))
    }
}

impl MemoryBus for SystemMemory {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError> {
        if buf.is_empty() {
            return Ok(());
        }
        let (bank, offset) = self.locate(Region::new(addr, buf.len() as u32))?;
        buf.copy_from_slice(&self.banks[bank].data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), BusError> {
        if data.is_empty() {
            return Ok(());
        }
        let (bank, offset) = self.locate(Region::new(addr, data.len() as u32))?;
        self.banks[bank].data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
