// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Validation and capture of a call's input/output vectors
//! OWNERS: @spm-team
//! PUBLIC API: IoVec, IoVecSet, marshal, MarshalError, VecDir
//! DEPENDS_ON: isolation::check_verified, mem::MemoryBus, conn::Connection
//! INVARIANTS: Descriptor arrays are copied into SPM memory before any field is trusted; no two
//!             non-empty vectors of one call overlap; a connection's vectors are published only when
//!             every check passed; written bytes never exceed an output vector's length

use psa_abi::{ControlWord, RawIoVec, PSA_MAX_IOVEC};
use thiserror::Error;

use crate::conn::{ConnState, Connection};
use crate::isolation::{self, AccessFlags, RegionTable};
use crate::mem::MemoryBus;
use crate::types::Region;

#[cfg(test)]
mod tests_prop;

/// Direction of a vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VecDir {
    In,
    Out,
}

/// Reasons a request's vectors were rejected. All of them are caller programming errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("connection is {0:?}, not marshalling")]
    NotMarshalling(ConnState),
    #[error("{in_len} in + {out_len} out vectors exceeds the limit")]
    TooManyVectors { in_len: usize, out_len: usize },
    #[error("{0:?} descriptor array at {1:#010x} is not accessible")]
    DescriptorDenied(VecDir, u32),
    #[error("{0:?} descriptor array at {1:#010x} could not be copied")]
    DescriptorUnreadable(VecDir, u32),
    #[error("vectors {0} and {1} overlap")]
    Overlap(Region, Region),
    #[error("{0:?} vector {1} is not accessible")]
    BufferDenied(VecDir, usize),
}

/// A validated buffer in caller memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoVec {
    base: u32,
    len: u32,
}

impl IoVec {
    pub const fn base(&self) -> u32 {
        self.base
    }

    pub const fn len(&self) -> u32 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    const fn region(&self) -> Region {
        Region::new(self.base, self.len)
    }
}

impl From<RawIoVec> for IoVec {
    fn from(raw: RawIoVec) -> Self {
        Self { base: raw.base, len: raw.len }
    }
}

/// The vectors of one request and the service's progress through them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoVecSet {
    inputs: [IoVec; PSA_MAX_IOVEC],
    outputs: [IoVec; PSA_MAX_IOVEC],
    in_len: u8,
    out_len: u8,
    consumed: [u32; PSA_MAX_IOVEC],
    written: [u32; PSA_MAX_IOVEC],
    reply_vec: Option<u32>,
}

impl IoVecSet {
    pub fn inputs(&self) -> &[IoVec] {
        &self.inputs[..self.in_len as usize]
    }

    pub fn outputs(&self) -> &[IoVec] {
        &self.outputs[..self.out_len as usize]
    }

    /// Caller address of the output descriptor array, where reply lengths go.
    pub const fn reply_vec(&self) -> Option<u32> {
        self.reply_vec
    }

    /// Bytes written so far into output vector `idx`.
    pub fn written(&self, idx: usize) -> u32 {
        self.written.get(idx).copied().unwrap_or(0)
    }

    /// Unread bytes of input vector `idx`.
    pub fn remaining(&self, idx: usize) -> Option<u32> {
        let vec = self.inputs().get(idx)?;
        Some(vec.len - self.consumed[idx])
    }

    /// Caller address and byte count of the next read of up to `max` bytes from input `idx`.
    pub(crate) fn input_cursor(&self, idx: usize, max: u32) -> Option<(u32, u32)> {
        let vec = self.inputs().get(idx)?;
        let consumed = self.consumed[idx];
        let n = (vec.len - consumed).min(max);
        // A drained vector may end exactly at the top of the address map.
        let addr = if n == 0 { vec.base } else { vec.base + consumed };
        Some((addr, n))
    }

    /// Marks `n` bytes of input `idx` as read; `n` comes from [`Self::input_cursor`].
    pub(crate) fn consume_input(&mut self, idx: usize, n: u32) {
        if let Some(consumed) = self.consumed.get_mut(idx) {
            *consumed += n;
        }
    }

    /// Consumes up to `max` bytes of input `idx`; returns the caller address and count.
    pub(crate) fn take_input(&mut self, idx: usize, max: u32) -> Option<(u32, u32)> {
        let (addr, n) = self.input_cursor(idx, max)?;
        self.consume_input(idx, n);
        Some((addr, n))
    }

    /// Caller address at which `len` more bytes of output `idx` go.
    ///
    /// Returns `None` if the vector does not exist or the write would not fit.
    pub(crate) fn output_cursor(&self, idx: usize, len: u32) -> Option<u32> {
        let vec = self.outputs().get(idx)?;
        let written = self.written[idx];
        let end = written.checked_add(len)?;
        if end > vec.len {
            return None;
        }
        Some(if len == 0 { vec.base } else { vec.base + written })
    }

    /// Records `len` bytes written to output `idx`; `len` was accepted by [`Self::output_cursor`].
    pub(crate) fn commit_output(&mut self, idx: usize, len: u32) {
        if let Some(written) = self.written.get_mut(idx) {
            *written += len;
        }
    }
}

fn copy_descriptors<M: MemoryBus>(
    mem: &M,
    dir: VecDir,
    addr: u32,
    count: usize,
) -> Result<[RawIoVec; PSA_MAX_IOVEC], MarshalError> {
    let mut out = [RawIoVec::default(); PSA_MAX_IOVEC];
    for (i, slot) in out.iter_mut().enumerate().take(count) {
        let mut bytes = [0u8; RawIoVec::SIZE];
        let entry = addr + (i * RawIoVec::SIZE) as u32;
        mem.read(entry, &mut bytes).map_err(|_| MarshalError::DescriptorUnreadable(dir, addr))?;
        *slot = RawIoVec::from_le_bytes(bytes);
    }
    Ok(out)
}

/// Validates the vectors described by `ctrl`, `in_desc` and `out_desc` and records them on
/// `conn`.
///
/// Checks run in a fixed order: vector count, descriptor-array access, copy of the arrays,
/// overlap, input buffers, output buffers. Each range is checked against the caller's
/// boundary. On any failure `conn` is left untouched.
pub fn marshal<M: MemoryBus>(
    conn: &mut Connection,
    ctrl: &ControlWord,
    in_desc: u32,
    out_desc: u32,
    table: &RegionTable,
    mem: &M,
) -> Result<(), MarshalError> {
    if conn.state() != ConnState::Marshalling {
        return Err(MarshalError::NotMarshalling(conn.state()));
    }
    let (in_len, out_len) = (ctrl.in_len(), ctrl.out_len());
    if in_len > PSA_MAX_IOVEC || out_len > PSA_MAX_IOVEC || in_len + out_len > PSA_MAX_IOVEC {
        return Err(MarshalError::TooManyVectors { in_len, out_len });
    }
    let boundary = conn.caller_boundary();
    let desc_size = RawIoVec::SIZE as u32;

    isolation::check_verified(table, boundary, in_desc, in_len as u32 * desc_size, AccessFlags::read(ctrl.ns_vec_desc()))
        .map_err(|_| MarshalError::DescriptorDenied(VecDir::In, in_desc))?;
    isolation::check_verified(
        table,
        boundary,
        out_desc,
        out_len as u32 * desc_size,
        AccessFlags::read_write(ctrl.ns_vec_desc()),
    )
    .map_err(|_| MarshalError::DescriptorDenied(VecDir::Out, out_desc))?;

    // Work only on local copies from here on; the caller may rewrite its arrays at any time.
    let raw_in = copy_descriptors(mem, VecDir::In, in_desc, in_len)?;
    let raw_out = copy_descriptors(mem, VecDir::Out, out_desc, out_len)?;

    let mut set = IoVecSet { in_len: in_len as u8, out_len: out_len as u8, ..IoVecSet::default() };
    for i in 0..in_len {
        set.inputs[i] = raw_in[i].into();
    }
    for i in 0..out_len {
        set.outputs[i] = raw_out[i].into();
    }

    let mut ranges = [Region::new(0, 0); PSA_MAX_IOVEC];
    for (slot, vec) in ranges.iter_mut().zip(set.inputs().iter().chain(set.outputs())) {
        *slot = vec.region();
    }
    let ranges = &ranges[..in_len + out_len];
    for (i, a) in ranges.iter().enumerate() {
        if let Some(b) = ranges[i + 1..].iter().find(|b| a.overlaps(**b)) {
            return Err(MarshalError::Overlap(*a, *b));
        }
    }

    for (i, vec) in set.inputs().iter().enumerate() {
        if vec.is_empty() {
            continue;
        }
        isolation::check_verified(table, boundary, vec.base, vec.len, AccessFlags::read(ctrl.ns_iovec()))
            .map_err(|_| MarshalError::BufferDenied(VecDir::In, i))?;
    }
    for (i, vec) in set.outputs().iter().enumerate() {
        if vec.is_empty() {
            continue;
        }
        isolation::check_verified(table, boundary, vec.base, vec.len, AccessFlags::read_write(ctrl.ns_iovec()))
            .map_err(|_| MarshalError::BufferDenied(VecDir::Out, i))?;
    }

    set.reply_vec = (out_len > 0).then_some(out_desc);
    conn.vectors = set;
    Ok(())
}
