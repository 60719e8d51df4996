// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Call ABI shared by partitions and the Secure Partition Manager
//! OWNERS: @spm-team
//! PUBLIC API: Status codes, Handle/HandleKind, ControlWord(+builder), RawIoVec, ClientId helpers
//! DEPENDS_ON: bitflags
//! INVARIANTS: in_len + out_len <= PSA_MAX_IOVEC; negative call types never packed;
//!             RawIoVec is 8 bytes LE; stateless handles carry bit 30

pub mod ctrl;

pub use ctrl::{CallType, ControlWord, ControlWordBuilder, CtrlError, VecFlags};

/// Status returned to callers across the call ABI.
pub type Status = i32;

/// Client identity. Secure clients are positive partition ids, non-secure clients are negative.
pub type ClientId = i32;

/// Service identifier.
pub type Sid = u32;

/// Maximum number of input plus output vectors in a single call.
pub const PSA_MAX_IOVEC: usize = 4;

/// Returned by `version` for unknown or inaccessible services.
pub const PSA_VERSION_NONE: u32 = 0;

/// Call completed.
pub const PSA_SUCCESS: Status = 0;
/// Caller violated the ABI; never retried.
pub const PSA_ERROR_PROGRAMMER_ERROR: Status = -129;
/// Service or policy refused the connection.
pub const PSA_ERROR_CONNECTION_REFUSED: Status = -130;
/// Transient resource exhaustion; the caller may retry later.
pub const PSA_ERROR_CONNECTION_BUSY: Status = -131;
/// Unspecified failure reported by a service.
pub const PSA_ERROR_GENERIC_ERROR: Status = -132;
/// Operation denied by a service.
pub const PSA_ERROR_NOT_PERMITTED: Status = -133;
/// Operation not supported by a service.
pub const PSA_ERROR_NOT_SUPPORTED: Status = -134;
/// Service rejected one of its parameters.
pub const PSA_ERROR_INVALID_ARGUMENT: Status = -135;
/// Output buffer too small for the service's reply.
pub const PSA_ERROR_BUFFER_TOO_SMALL: Status = -138;

/// Message type delivered to a service when a client opens a session.
pub const PSA_IPC_CONNECT: i32 = -1;
/// Default request type for `call`.
pub const PSA_IPC_CALL: i32 = 0;
/// Message type delivered to a service when a client closes a session.
pub const PSA_IPC_DISCONNECT: i32 = -2;

/// Returns true when `client` identifies a non-secure caller.
#[inline]
pub const fn is_ns_client(client: ClientId) -> bool {
    client < 0
}

/// Returns true when `status` is a reply status a service is allowed to send for a call.
///
/// The band `PSA_ERROR_CONNECTION_BUSY..=PSA_ERROR_PROGRAMMER_ERROR` is reserved for the
/// partition manager itself.
#[inline]
pub const fn is_valid_call_reply(status: Status) -> bool {
    !(status >= PSA_ERROR_CONNECTION_BUSY && status <= PSA_ERROR_PROGRAMMER_ERROR)
}

/// Capability handle passed by clients.
pub type Handle = i32;

/// The null handle.
pub const PSA_NULL_HANDLE: Handle = 0;

/// Bit 30 marks a static handle to a stateless service.
pub const STATELESS_HANDLE_MARK: Handle = 0x4000_0000;
const STATELESS_INDEX_SHIFT: u32 = 8;
const STATELESS_INDEX_MASK: Handle = 0xff << STATELESS_INDEX_SHIFT;
const STATELESS_VERSION_MASK: Handle = 0xff;
const STATELESS_RESERVED_MASK: Handle =
    !(STATELESS_HANDLE_MARK | STATELESS_INDEX_MASK | STATELESS_VERSION_MASK);

/// Encodes the static handle of the stateless service at `index` with `version`.
#[inline]
pub const fn stateless_handle(index: u8, version: u8) -> Handle {
    STATELESS_HANDLE_MARK | ((index as Handle) << STATELESS_INDEX_SHIFT) | version as Handle
}

/// Decoded view of a raw handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    /// `PSA_NULL_HANDLE`.
    Null,
    /// Static handle naming a stateless service.
    Stateless {
        /// Index into the SPM's stateless service table.
        index: u8,
        /// Service version the handle was issued for.
        version: u8,
    },
    /// Session handle issued by `connect`.
    Stateful(Handle),
    /// Negative values and stateless handles with reserved bits set.
    Invalid,
}

impl HandleKind {
    /// Classifies a raw handle. Never trusts reserved bits.
    pub const fn classify(handle: Handle) -> Self {
        if handle == PSA_NULL_HANDLE {
            return Self::Null;
        }
        if handle < 0 {
            return Self::Invalid;
        }
        if handle & STATELESS_HANDLE_MARK == 0 {
            return Self::Stateful(handle);
        }
        if handle & STATELESS_RESERVED_MASK != 0 {
            return Self::Invalid;
        }
        Self::Stateless {
            index: ((handle & STATELESS_INDEX_MASK) >> STATELESS_INDEX_SHIFT) as u8,
            version: (handle & STATELESS_VERSION_MASK) as u8,
        }
    }
}

/// In-memory layout of one `psa_invec` / `psa_outvec` entry in caller memory.
///
/// The reply path writes the number of bytes produced into the `len` field of each
/// output entry, at offset [`RawIoVec::LEN_OFFSET`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawIoVec {
    /// Base address of the buffer.
    pub base: u32,
    /// Length of the buffer in bytes.
    pub len: u32,
}

impl RawIoVec {
    /// Size of one entry in bytes.
    pub const SIZE: usize = core::mem::size_of::<Self>();
    /// Offset of the `len` field within an entry.
    pub const LEN_OFFSET: u32 = 4;

    /// Creates a descriptor.
    pub const fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }

    /// Serialises the entry as it appears in little-endian caller memory.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.base.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    /// Deserialises an entry copied out of caller memory.
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let base = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { base, len }
    }
}
