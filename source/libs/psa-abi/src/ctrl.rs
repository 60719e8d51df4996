// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control word carried by every `call`.
//!
//! Packed layout (`u32`):
//!
//! ```text
//!  31            16 15 14 13 12 11 10  8 7     3 2   0
//! +----------------+-----+--+--+--+-----+-------+-----+
//! |   call type    | rsv |IO|VD|rs| in  |  rsv  | out |
//! +----------------+-----+--+--+--+-----+-------+-----+
//! ```
//!
//! `VD` marks the vector descriptor arrays as non-secure memory, `IO` marks the
//! buffers they point at as non-secure memory. Reserved bits must be zero.

use bitflags::bitflags;
use core::fmt;

use crate::PSA_MAX_IOVEC;

const TYPE_SHIFT: u32 = 16;
const IN_LEN_SHIFT: u32 = 8;
const LEN_MASK: u32 = 0x7;
const OUT_LEN_SHIFT: u32 = 0;

bitflags! {
    /// Domain flags of a control word, kept at their packed bit positions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct VecFlags: u32 {
        /// The in/out descriptor arrays live in non-secure memory.
        const NS_VEC_DESC = 1 << 12;
        /// The buffers described by the vectors live in non-secure memory.
        const NS_IOVEC = 1 << 13;
    }
}

const RESERVED_MASK: u32 = !((0xffff << TYPE_SHIFT)
    | (LEN_MASK << IN_LEN_SHIFT)
    | (LEN_MASK << OUT_LEN_SHIFT)
    | VecFlags::all().bits());

/// Errors produced while building or unpacking a control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtrlError {
    /// Negative request types are reserved for connect/disconnect.
    InvalidCallType(i32),
    /// `in_len + out_len` exceeds [`PSA_MAX_IOVEC`].
    TooManyVectors {
        /// Requested input vectors.
        in_len: usize,
        /// Requested output vectors.
        out_len: usize,
    },
    /// A reserved bit was set in a packed word.
    ReservedBits(u32),
}

impl fmt::Display for CtrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCallType(ty) => write!(f, "invalid call type {ty}"),
            Self::TooManyVectors { in_len, out_len } => {
                write!(f, "{in_len} in + {out_len} out vectors exceeds {PSA_MAX_IOVEC}")
            }
            Self::ReservedBits(bits) => write!(f, "reserved control bits set: {bits:#010x}"),
        }
    }
}

/// Request type of a call. Always non-negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CallType(i16);

impl CallType {
    /// `PSA_IPC_CALL`.
    pub const DEFAULT: Self = Self(0);

    /// Validates a raw request type.
    pub const fn new(raw: i32) -> Result<Self, CtrlError> {
        if raw < 0 || raw > i16::MAX as i32 {
            return Err(CtrlError::InvalidCallType(raw));
        }
        Ok(Self(raw as i16))
    }

    /// Returns the request type as delivered to the service.
    pub const fn as_raw(self) -> i32 {
        self.0 as i32
    }
}

/// Decoded control word.
///
/// Only constructible through [`ControlWordBuilder`] or [`ControlWord::unpack`], both of
/// which enforce the vector-count limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlWord {
    call_type: CallType,
    in_len: u8,
    out_len: u8,
    flags: VecFlags,
}

impl ControlWord {
    /// Starts a builder for a `PSA_IPC_CALL` with no vectors.
    pub const fn builder() -> ControlWordBuilder {
        ControlWordBuilder::new()
    }

    /// Request type.
    pub const fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Number of input vectors.
    pub const fn in_len(&self) -> usize {
        self.in_len as usize
    }

    /// Number of output vectors.
    pub const fn out_len(&self) -> usize {
        self.out_len as usize
    }

    /// Whether the descriptor arrays live in non-secure memory.
    pub const fn ns_vec_desc(&self) -> bool {
        self.flags.contains(VecFlags::NS_VEC_DESC)
    }

    /// Whether the vector buffers live in non-secure memory.
    pub const fn ns_iovec(&self) -> bool {
        self.flags.contains(VecFlags::NS_IOVEC)
    }

    /// Domain flags.
    pub const fn flags(&self) -> VecFlags {
        self.flags
    }

    /// Packs the word into its ABI representation.
    pub const fn pack(&self) -> u32 {
        ((self.call_type.0 as u16 as u32) << TYPE_SHIFT)
            | ((self.in_len as u32) << IN_LEN_SHIFT)
            | ((self.out_len as u32) << OUT_LEN_SHIFT)
            | self.flags.bits()
    }

    /// Decodes a packed word received from a caller.
    pub fn unpack(raw: u32) -> Result<Self, CtrlError> {
        if raw & RESERVED_MASK != 0 {
            return Err(CtrlError::ReservedBits(raw & RESERVED_MASK));
        }
        let call_type = CallType::new((raw >> TYPE_SHIFT) as u16 as i16 as i32)?;
        let in_len = ((raw >> IN_LEN_SHIFT) & LEN_MASK) as usize;
        let out_len = ((raw >> OUT_LEN_SHIFT) & LEN_MASK) as usize;
        check_counts(in_len, out_len)?;
        Ok(Self {
            call_type,
            in_len: in_len as u8,
            out_len: out_len as u8,
            flags: VecFlags::from_bits_truncate(raw),
        })
    }
}

const fn check_counts(in_len: usize, out_len: usize) -> Result<(), CtrlError> {
    // Each count is checked alone first so the sum cannot wrap.
    if in_len > PSA_MAX_IOVEC || out_len > PSA_MAX_IOVEC || in_len + out_len > PSA_MAX_IOVEC {
        return Err(CtrlError::TooManyVectors { in_len, out_len });
    }
    Ok(())
}

/// Validating builder for [`ControlWord`].
#[derive(Clone, Copy, Debug)]
#[must_use = "a builder does nothing until `build` is called"]
pub struct ControlWordBuilder {
    call_type: i32,
    in_len: usize,
    out_len: usize,
    flags: VecFlags,
}

impl ControlWordBuilder {
    const fn new() -> Self {
        Self { call_type: 0, in_len: 0, out_len: 0, flags: VecFlags::empty() }
    }

    /// Sets the request type.
    pub const fn call_type(mut self, ty: i32) -> Self {
        self.call_type = ty;
        self
    }

    /// Sets the number of input vectors.
    pub const fn inputs(mut self, count: usize) -> Self {
        self.in_len = count;
        self
    }

    /// Sets the number of output vectors.
    pub const fn outputs(mut self, count: usize) -> Self {
        self.out_len = count;
        self
    }

    /// Marks the descriptor arrays as non-secure.
    pub fn ns_vec_desc(mut self, on: bool) -> Self {
        self.flags.set(VecFlags::NS_VEC_DESC, on);
        self
    }

    /// Marks the vector buffers as non-secure.
    pub fn ns_iovec(mut self, on: bool) -> Self {
        self.flags.set(VecFlags::NS_IOVEC, on);
        self
    }

    /// Validates and produces the control word.
    pub fn build(self) -> Result<ControlWord, CtrlError> {
        let call_type = CallType::new(self.call_type)?;
        check_counts(self.in_len, self.out_len)?;
        Ok(ControlWord {
            call_type,
            in_len: self.in_len as u8,
            out_len: self.out_len as u8,
            flags: self.flags,
        })
    }
}
