// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Connection records for in-flight and established client/service links
//! OWNERS: @spm-team
//! PUBLIC API: ConnectionManager (get_connection/lease_stateless/open_session/session/transition/
//!             free_connection), Connection, ConnId, ConnState, ConnError, PoolKind
//! DEPENDS_ON: iovec::IoVecSet, boundary::BoundaryToken
//! INVARIANTS: At most one live connection per stateless service; session handles are only honoured
//!             for the client that opened them; stale ids never alias a reused slot; state moves only
//!             along Idle -> Marshalling -> Dispatched -> Completing -> Idle, or Marshalling -> Idle
//!
//! Connections live in two generation-checked arenas: a fixed pool for calls on stateless
//! services and a pool of sessions opened by `connect`. A [`ConnId`] names a slot and the
//! generation it was issued for; freeing a slot bumps its generation.

use alloc::vec::Vec;
use core::fmt;

use psa_abi::{ClientId, Handle, HandleKind, Sid};
use thiserror::Error;

use crate::boundary::BoundaryToken;
use crate::iovec::IoVecSet;
use crate::ipc::MessageKind;
use crate::types::PartitionId;

#[cfg(test)]
mod tests_prop;

/// Largest generation that keeps session handles clear of the stateless marker bit.
const GENERATION_MAX: u16 = 0x3fff;
const HANDLE_INDEX_MASK: Handle = 0xffff;
const HANDLE_GENERATION_SHIFT: u32 = 16;

/// Failures of connection lookups and transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConnError {
    #[error("no such connection")]
    NotFound,
    #[error("connection is busy")]
    Busy,
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("illegal transition {from:?} -> {to:?}")]
    BadState { from: ConnState, to: ConnState },
}

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Established session with no call in flight.
    Idle,
    /// Vectors of a new request are being validated.
    Marshalling,
    /// Delivered to the service; waiting for its reply.
    Dispatched,
    /// The service replied; results are being written back.
    Completing,
}

impl ConnState {
    const fn can_move_to(self, to: ConnState) -> bool {
        matches!(
            (self, to),
            (ConnState::Idle, ConnState::Marshalling)
                | (ConnState::Marshalling, ConnState::Dispatched)
                | (ConnState::Marshalling, ConnState::Idle)
                | (ConnState::Dispatched, ConnState::Completing)
                | (ConnState::Completing, ConnState::Idle)
        )
    }
}

/// Which arena a connection lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Stateless,
    Session,
}

/// Generation-checked reference to a connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pool: PoolKind,
    index: u16,
    generation: u16,
}

impl ConnId {
    pub const fn pool(&self) -> PoolKind {
        self.pool
    }

    /// Client-visible handle of a session. Always positive and below the stateless marker.
    fn session_handle(self) -> Handle {
        ((self.generation as Handle) << HANDLE_GENERATION_SHIFT) | (self.index as Handle + 1)
    }

    fn from_session_handle(handle: Handle) -> Option<Self> {
        let index = (handle & HANDLE_INDEX_MASK) as u16;
        let generation = (handle >> HANDLE_GENERATION_SHIFT) as u16;
        if index == 0 || generation == 0 || generation > GENERATION_MAX {
            return None;
        }
        Some(Self { pool: PoolKind::Session, index: index - 1, generation })
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}.{}", self.pool, self.index, self.generation)
    }
}

/// One client/service link.
#[derive(Clone, Debug)]
pub struct Connection {
    service: Sid,
    /// Partition that issued the request (the NS agent for non-secure clients).
    caller: PartitionId,
    client: ClientId,
    caller_boundary: BoundaryToken,
    state: ConnState,
    /// Request currently marshalled or in flight.
    pub(crate) request: Option<MessageKind>,
    /// Service-private value attached to a session.
    pub(crate) rhandle: Option<usize>,
    pub(crate) vectors: IoVecSet,
}

impl Connection {
    /// A connection that has not been used yet. Stateless calls move it straight to
    /// `Marshalling`; sessions start `Idle`.
    pub fn new(service: Sid, caller: PartitionId, client: ClientId, caller_boundary: BoundaryToken) -> Self {
        Self {
            service,
            caller,
            client,
            caller_boundary,
            state: ConnState::Idle,
            request: None,
            rhandle: None,
            vectors: IoVecSet::default(),
        }
    }

    pub const fn service(&self) -> Sid {
        self.service
    }

    pub const fn caller(&self) -> PartitionId {
        self.caller
    }

    pub const fn client(&self) -> ClientId {
        self.client
    }

    pub const fn caller_boundary(&self) -> BoundaryToken {
        self.caller_boundary
    }

    pub const fn state(&self) -> ConnState {
        self.state
    }

    pub const fn request(&self) -> Option<MessageKind> {
        self.request
    }

    pub const fn rhandle(&self) -> Option<usize> {
        self.rhandle
    }

    pub fn vectors(&self) -> &IoVecSet {
        &self.vectors
    }
}

struct Slot {
    generation: u16,
    conn: Option<Connection>,
}

struct Arena {
    pool: PoolKind,
    slots: Vec<Slot>,
    capacity: usize,
}

impl Arena {
    fn new(pool: PoolKind, capacity: usize) -> Self {
        Self { pool, slots: Vec::with_capacity(capacity), capacity }
    }

    fn insert(&mut self, conn: Connection) -> Result<ConnId, ConnError> {
        let index = match self.slots.iter().position(|slot| slot.conn.is_none()) {
            Some(index) => index,
            None if self.slots.len() < self.capacity && self.slots.len() < u16::MAX as usize => {
                self.slots.push(Slot { generation: 1, conn: None });
                self.slots.len() - 1
            }
            None => return Err(ConnError::Exhausted),
        };
        let slot = &mut self.slots[index];
        slot.conn = Some(conn);
        Ok(ConnId { pool: self.pool, index: index as u16, generation: slot.generation })
    }

    fn slot(&self, id: ConnId) -> Option<&Slot> {
        if id.pool != self.pool {
            return None;
        }
        self.slots.get(id.index as usize).filter(|slot| slot.generation == id.generation)
    }

    fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slot(id).and_then(|slot| slot.conn.as_ref())
    }

    fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slot(id)?;
        self.slots[id.index as usize].conn.as_mut()
    }

    fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.slot(id)?;
        let slot = &mut self.slots[id.index as usize];
        let conn = slot.conn.take()?;
        slot.generation = if slot.generation >= GENERATION_MAX { 1 } else { slot.generation + 1 };
        Some(conn)
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.conn.is_some()).count()
    }
}

/// Owner of every connection record.
pub struct ConnectionManager {
    stateless: Arena,
    sessions: Arena,
    /// Live stateless connection per stateless-service index.
    leases: Vec<(u8, ConnId)>,
}

impl ConnectionManager {
    pub fn new(stateless_slots: usize, max_sessions: usize) -> Self {
        Self {
            stateless: Arena::new(PoolKind::Stateless, stateless_slots),
            sessions: Arena::new(PoolKind::Session, max_sessions),
            leases: Vec::with_capacity(stateless_slots),
        }
    }

    fn arena(&self, pool: PoolKind) -> &Arena {
        match pool {
            PoolKind::Stateless => &self.stateless,
            PoolKind::Session => &self.sessions,
        }
    }

    fn arena_mut(&mut self, pool: PoolKind) -> &mut Arena {
        match pool {
            PoolKind::Stateless => &mut self.stateless,
            PoolKind::Session => &mut self.sessions,
        }
    }

    /// Resolves a client handle to a connection ready for a new request.
    ///
    /// Stateless handles lease a fresh connection built by `stateless`, which receives the
    /// handle's service index and version. Session handles must belong to `client`.
    pub fn get_connection<F>(&mut self, handle: Handle, client: ClientId, stateless: F) -> Result<ConnId, ConnError>
    where
        F: FnOnce(u8, u8) -> Result<Connection, ConnError>,
    {
        match HandleKind::classify(handle) {
            HandleKind::Stateless { index, version } => {
                let conn = stateless(index, version)?;
                self.lease_stateless(index, conn)
            }
            HandleKind::Stateful(raw) => self.session(raw, client),
            HandleKind::Null | HandleKind::Invalid => Err(ConnError::NotFound),
        }
    }

    /// Allocates the connection for one call on stateless service `index`, in `Marshalling`.
    pub fn lease_stateless(&mut self, index: u8, mut conn: Connection) -> Result<ConnId, ConnError> {
        if self.leases.iter().any(|(leased, _)| *leased == index) {
            return Err(ConnError::Busy);
        }
        conn.state = ConnState::Marshalling;
        let id = self.stateless.insert(conn)?;
        self.leases.push((index, id));
        Ok(id)
    }

    /// Allocates a session, in `Idle`.
    pub fn open_session(&mut self, mut conn: Connection) -> Result<ConnId, ConnError> {
        conn.state = ConnState::Idle;
        self.sessions.insert(conn)
    }

    /// Resolves a session handle owned by `client`.
    pub fn session(&self, handle: Handle, client: ClientId) -> Result<ConnId, ConnError> {
        let id = ConnId::from_session_handle(handle).ok_or(ConnError::NotFound)?;
        match self.sessions.get(id) {
            Some(conn) if conn.client == client => Ok(id),
            _ => Err(ConnError::NotFound),
        }
    }

    /// Client-visible handle of a session.
    pub fn session_handle(&self, id: ConnId) -> Option<Handle> {
        (id.pool == PoolKind::Session && self.sessions.get(id).is_some()).then(|| id.session_handle())
    }

    pub fn get(&self, id: ConnId) -> Result<&Connection, ConnError> {
        self.arena(id.pool).get(id).ok_or(ConnError::NotFound)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Result<&mut Connection, ConnError> {
        self.arena_mut(id.pool).get_mut(id).ok_or(ConnError::NotFound)
    }

    /// Moves a connection along its lifecycle. Returning to `Idle` drops the request's vectors.
    pub fn transition(&mut self, id: ConnId, to: ConnState) -> Result<(), ConnError> {
        let conn = self.get_mut(id)?;
        if !conn.state.can_move_to(to) {
            return Err(ConnError::BadState { from: conn.state, to });
        }
        conn.state = to;
        if to == ConnState::Idle {
            conn.request = None;
            conn.vectors = IoVecSet::default();
        }
        Ok(())
    }

    /// Releases a connection; its id and handle become stale.
    pub fn free_connection(&mut self, id: ConnId) -> Result<Connection, ConnError> {
        let conn = self.arena_mut(id.pool).remove(id).ok_or(ConnError::NotFound)?;
        if id.pool == PoolKind::Stateless {
            self.leases.retain(|(_, leased)| *leased != id);
        }
        log::trace!(target: "spm::conn", "free {:?} sid={:#x}", id, conn.service);
        Ok(conn)
    }

    pub fn live_stateless(&self) -> usize {
        self.stateless.live()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.live()
    }
}
