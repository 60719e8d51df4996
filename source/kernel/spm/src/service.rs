// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service table and client access policy
//! OWNERS: @spm-team
//! PUBLIC API: ServiceDescriptor, VersionPolicy, ServiceTable (register/lookup/stateless/
//!             stateless_handle), ServiceError
//! INVARIANTS: SIDs are unique; stateless services get a stable index in registration order;
//!             stateless handles encode that index and the service version

use alloc::string::String;
use alloc::vec::Vec;

use psa_abi::{stateless_handle, Handle, Sid};
use serde::Deserialize;
use thiserror::Error;

use crate::types::PartitionId;

/// Largest number of stateless services a handle can index.
pub const MAX_STATELESS_SERVICES: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service {0:#x} is already registered")]
    Duplicate(Sid),
    #[error("too many stateless services")]
    TooManyStateless,
    #[error("stateless service {0:#x} needs a version below 256")]
    StatelessVersion(Sid),
}

/// How a requested version is matched against the service's version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionPolicy {
    /// Requested version must equal the service version.
    Strict,
    /// Any requested version up to the service version is accepted.
    #[default]
    Relaxed,
}

/// Static description of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub sid: Sid,
    pub name: String,
    pub partition: PartitionId,
    pub version: u32,
    pub policy: VersionPolicy,
    pub stateless: bool,
    pub non_secure_clients: bool,
}

impl ServiceDescriptor {
    pub fn new(sid: Sid, name: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            sid,
            name: name.into(),
            partition,
            version: 1,
            policy: VersionPolicy::Relaxed,
            stateless: false,
            non_secure_clients: false,
        }
    }

    pub fn version(mut self, version: u32, policy: VersionPolicy) -> Self {
        self.version = version;
        self.policy = policy;
        self
    }

    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }

    pub fn non_secure_clients(mut self) -> Self {
        self.non_secure_clients = true;
        self
    }

    /// Whether a client asking for `requested` is served.
    pub fn accepts_version(&self, requested: u32) -> bool {
        match self.policy {
            VersionPolicy::Strict => requested == self.version,
            VersionPolicy::Relaxed => requested <= self.version,
        }
    }
}

struct Entry {
    desc: ServiceDescriptor,
    stateless_index: Option<u8>,
}

/// Registered services.
#[derive(Default)]
pub struct ServiceTable {
    entries: Vec<Entry>,
    stateless_count: usize,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, desc: ServiceDescriptor) -> Result<(), ServiceError> {
        if self.lookup(desc.sid).is_some() {
            return Err(ServiceError::Duplicate(desc.sid));
        }
        let stateless_index = if desc.stateless {
            if self.stateless_count >= MAX_STATELESS_SERVICES {
                return Err(ServiceError::TooManyStateless);
            }
            if desc.version > u8::MAX as u32 {
                return Err(ServiceError::StatelessVersion(desc.sid));
            }
            self.stateless_count += 1;
            Some((self.stateless_count - 1) as u8)
        } else {
            None
        };
        self.entries.push(Entry { desc, stateless_index });
        Ok(())
    }

    pub fn lookup(&self, sid: Sid) -> Option<&ServiceDescriptor> {
        self.entries.iter().find(|e| e.desc.sid == sid).map(|e| &e.desc)
    }

    /// Stateless service at handle index `index`.
    pub fn stateless(&self, index: u8) -> Option<&ServiceDescriptor> {
        self.entries.iter().find(|e| e.stateless_index == Some(index)).map(|e| &e.desc)
    }

    /// Static handle clients use to call stateless service `sid`.
    pub fn stateless_handle(&self, sid: Sid) -> Option<Handle> {
        let entry = self.entries.iter().find(|e| e.desc.sid == sid)?;
        let index = entry.stateless_index?;
        Some(stateless_handle(index, entry.desc.version as u8))
    }
}
