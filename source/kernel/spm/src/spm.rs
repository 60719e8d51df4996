// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SPM front end: client calls, service message handling, partition switching
//! OWNERS: @spm-team
//! PUBLIC API: Spm (new/from_manifest/add_partition/add_service/start_partition,
//!             version/connect/call/close, get/read/skip/write/set_rhandle/reply, wait/schedule),
//!             Caller, Pending, MessageInfo, Completion, SwitchInfo, SpmError, SetupError
//! DEPENDS_ON: every other module of the crate
//! INVARIANTS: Connection state changes happen under the scheduler lock; callers always get an
//!             explicit status; reply write-back happens once per call; the control word is
//!             validated before any memory is inspected
//!
//! Calls are asynchronous at this layer: `connect`, `call` and `close` return [`Pending`] once
//! the request is queued, and the caller's status arrives in the [`Completion`] produced by
//! the service's `reply`.

use alloc::vec::Vec;
use core::marker::PhantomData;

use psa_abi::{
    is_ns_client, is_valid_call_reply, ClientId, ControlWord, CtrlError, Handle, HandleKind, RawIoVec, Sid,
    Status, PSA_ERROR_CONNECTION_BUSY, PSA_ERROR_CONNECTION_REFUSED, PSA_ERROR_PROGRAMMER_ERROR,
    PSA_MAX_IOVEC, PSA_SUCCESS, PSA_VERSION_NONE,
};
use thiserror::Error;

use crate::arch::{self, fatal, ArchOps, Fatal, SchedLock, ThreadContext};
use crate::boundary::{self, BoundaryError, BoundaryManager, BoundaryToken, PartitionDescriptor};
use crate::config::{ConfigError, PlatformManifest, SpmConfig};
use crate::conn::{ConnError, ConnId, ConnState, Connection, ConnectionManager, PoolKind};
use crate::iovec::{self, MarshalError};
use crate::ipc::{IpcError, Message, MessageKind, MessagingBackend, Router};
use crate::isolation::{self, AccessFlags, RegionTable};
use crate::mem::{BusError, MemoryBus, SystemMemory};
use crate::sched::{EnqueueOutcome, Scheduler};
use crate::service::{ServiceDescriptor, ServiceError, ServiceTable};
use crate::types::{PartitionId, Region};

/// Who is calling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Caller {
    /// A secure partition calling on its own behalf.
    Secure(PartitionId),
    /// A non-secure client, proxied by the NS agent partition.
    NonSecure(ClientId),
}

/// Rejections of client and service operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SpmError {
    #[error("malformed control word: {0}")]
    Control(CtrlError),
    #[error("invalid handle {0:#x}")]
    InvalidHandle(Handle),
    #[error("unknown caller {0:?}")]
    UnknownCaller(Caller),
    #[error("unknown service {0:#x}")]
    UnknownService(Sid),
    #[error("client {client} may not access service {sid:#x}")]
    AccessDenied { client: ClientId, sid: Sid },
    #[error("service {sid:#x} does not accept version {requested}")]
    Version { sid: Sid, requested: u32 },
    #[error("service {0:#x} is stateless")]
    Stateless(Sid),
    #[error("connection: {0}")]
    Conn(ConnError),
    #[error("vectors: {0}")]
    Marshal(MarshalError),
    #[error("delivery: {0}")]
    Ipc(IpcError),
    #[error("memory: {0}")]
    Bus(BusError),
    #[error("message is not addressed to partition {0}")]
    NotOwner(PartitionId),
    #[error("message is not awaiting a reply")]
    NotDispatched,
    #[error("vector {0} does not exist")]
    NoSuchVector(usize),
    #[error("write of {len} bytes overflows output vector {idx}")]
    OutputOverflow { idx: usize, len: u32 },
    #[error("service buffer {0} is not accessible")]
    ServiceBuffer(Region),
    #[error("status {0} may not be used in this reply")]
    InvalidReply(Status),
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
}

impl SpmError {
    /// Status reported across the call ABI.
    pub const fn status(&self) -> Status {
        match self {
            SpmError::Conn(ConnError::Busy | ConnError::Exhausted) | SpmError::Ipc(IpcError::QueueFull(_)) => {
                PSA_ERROR_CONNECTION_BUSY
            }
            SpmError::AccessDenied { .. } | SpmError::Version { .. } => PSA_ERROR_CONNECTION_REFUSED,
            _ => PSA_ERROR_PROGRAMMER_ERROR,
        }
    }
}

/// Failures while assembling a platform.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("partition id {0} is reserved")]
    ReservedPartitionId(PartitionId),
    #[error("partition {0} is already registered")]
    DuplicatePartition(PartitionId),
    #[error("service references unknown partition {0}")]
    UnknownPartition(PartitionId),
    #[error("partition {0} would be a second NS agent")]
    SecondNsAgent(PartitionId),
}

/// A request queued for its service.
#[must_use = "the caller's status arrives with the matching Completion"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pending {
    pub conn: ConnId,
    pub caller: PartitionId,
    pub client: ClientId,
}

/// What a service sees of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    pub handle: ConnId,
    pub sid: Sid,
    pub kind: MessageKind,
    pub client: ClientId,
    pub in_size: [u32; PSA_MAX_IOVEC],
    pub out_size: [u32; PSA_MAX_IOVEC],
    pub rhandle: Option<usize>,
}

/// Result delivered to the caller when a service replies.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub conn: ConnId,
    pub caller: PartitionId,
    pub client: ClientId,
    pub status: Status,
    /// Session handle for an accepted `connect`.
    pub handle: Option<Handle>,
}

/// Outcome of a scheduling decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchInfo {
    pub from: Option<PartitionId>,
    pub to: PartitionId,
    pub exc_return: u32,
    /// The boundary was reprogrammed.
    pub boundary_switched: bool,
}

struct PartitionRecord {
    desc: PartitionDescriptor,
    token: BoundaryToken,
    context: Option<ThreadContext>,
}

/// The Secure Partition Manager.
///
/// `!Send` and `!Sync`: it owns the processor and runs on a single core.
pub struct Spm<M, A, B> {
    config: SpmConfig,
    regions: RegionTable,
    boundaries: BoundaryManager,
    partitions: Vec<PartitionRecord>,
    services: ServiceTable,
    conns: ConnectionManager,
    backend: B,
    mem: M,
    arch: A,
    lock: SchedLock,
    sched: Scheduler,
    running: Option<PartitionId>,
    ns_agent: Option<PartitionId>,
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Spm<SystemMemory, arch::HostArch, Router>: Send, Sync);

impl<A: ArchOps> Spm<SystemMemory, A, Router> {
    /// Assembles a simulated platform from a manifest.
    pub fn from_manifest(manifest: &PlatformManifest, arch: A) -> Result<Self, SetupError> {
        manifest.spm.validate()?;
        let resolver = BoundaryManager::new(manifest.spm.isolation_level, manifest.spm.named_resources.clone())?;
        let regions = manifest.region_table(&resolver)?;
        let mem = manifest.memory()?;
        let backend = Router::new(manifest.spm.queue_depth);
        let mut spm = Self::new(manifest.spm.clone(), regions, mem, arch, backend)?;
        for desc in manifest.partition_descriptors() {
            spm.add_partition(desc)?;
        }
        for desc in manifest.service_descriptors() {
            spm.add_service(desc)?;
        }
        Ok(spm)
    }
}

impl<M: MemoryBus, A: ArchOps, B: MessagingBackend> Spm<M, A, B> {
    pub fn new(config: SpmConfig, regions: RegionTable, mem: M, arch: A, backend: B) -> Result<Self, SetupError> {
        config.validate()?;
        let boundaries = BoundaryManager::new(config.isolation_level, config.named_resources.clone())?;
        let conns = ConnectionManager::new(config.stateless_slots, config.max_sessions);
        log::info!(
            target: "spm::boot",
            "spm level={:?} stateless_slots={} sessions={} regions={}",
            config.isolation_level,
            config.stateless_slots,
            config.max_sessions,
            regions.len()
        );
        Ok(Self {
            config,
            regions,
            boundaries,
            partitions: Vec::new(),
            services: ServiceTable::new(),
            conns,
            backend,
            mem,
            arch,
            lock: SchedLock::new(),
            sched: Scheduler::new(),
            running: None,
            ns_agent: None,
            _not_send_sync: PhantomData,
        })
    }

    // ---- platform assembly -------------------------------------------------------------

    /// Registers a partition and binds its boundary.
    pub fn add_partition(&mut self, desc: PartitionDescriptor) -> Result<BoundaryToken, SetupError> {
        if desc.id.as_raw() == 0 || desc.id.client_id() <= 0 {
            return Err(SetupError::ReservedPartitionId(desc.id));
        }
        if self.record(desc.id).is_some() {
            return Err(SetupError::DuplicatePartition(desc.id));
        }
        if desc.ns_agent && self.ns_agent.is_some() {
            return Err(SetupError::SecondNsAgent(desc.id));
        }
        let token = self.boundaries.bind(&desc)?;
        if desc.ns_agent {
            self.ns_agent = Some(desc.id);
        }
        self.partitions.push(PartitionRecord { desc, token, context: None });
        Ok(token)
    }

    /// Registers a service hosted by an already registered partition.
    pub fn add_service(&mut self, desc: ServiceDescriptor) -> Result<(), SetupError> {
        if self.record(desc.partition).is_none() {
            return Err(SetupError::UnknownPartition(desc.partition));
        }
        let sid = desc.sid;
        self.services.register(desc)?;
        self.backend.register(sid)?;
        Ok(())
    }

    /// Builds the initial thread of `id` and makes it runnable.
    pub fn start_partition(&mut self, id: PartitionId) -> Result<(), SpmError> {
        let index = self.partitions.iter().position(|p| p.desc.id == id).ok_or(SpmError::UnknownPartition(id))?;
        let record = &mut self.partitions[index];
        let ctx = arch::init_context(&mut self.mem, record.desc.stack, record.desc.entry, 0);
        record.context = Some(ctx);
        log::debug!(target: "spm::boot", "start partition={} {}", id, ctx);
        self.locked(|spm| spm.wake(id));
        Ok(())
    }

    // ---- accessors ---------------------------------------------------------------------

    pub fn config(&self) -> &SpmConfig {
        &self.config
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conns
    }

    pub fn boundary_of(&self, id: PartitionId) -> Option<BoundaryToken> {
        self.boundaries.token_of(id)
    }

    pub fn running(&self) -> Option<PartitionId> {
        self.running
    }

    /// Static handle for calling stateless service `sid`.
    pub fn stateless_handle(&self, sid: Sid) -> Option<Handle> {
        self.services.stateless_handle(sid)
    }

    fn record(&self, id: PartitionId) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.desc.id == id)
    }

    // ---- critical sections and wake-ups ------------------------------------------------

    fn locked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.lock.lock();
        let result = f(self);
        let _ = self.lock.unlock(&mut self.arch);
        result
    }

    /// Makes `id` runnable and asks for a reschedule. Partitions that were never started stay put.
    fn wake(&mut self, id: PartitionId) {
        let Some(record) = self.record(id) else {
            return;
        };
        if record.context.is_none() {
            return;
        }
        match self.sched.try_enqueue(id, record.desc.priority) {
            EnqueueOutcome::Rejected(reason) => {
                log::warn!(target: "spm::sched", "wake partition={} rejected: {:?}", id, reason);
            }
            EnqueueOutcome::Enqueued | EnqueueOutcome::AlreadyRunnable => {}
        }
        let _ = self.lock.request_reschedule(&mut self.arch);
    }

    /// The running partition gives up the CPU until woken.
    fn block(&mut self, id: PartitionId) {
        if self.sched.current() == Some(id) {
            self.sched.block_current();
        }
    }

    // ---- client side -------------------------------------------------------------------

    /// Resolves a caller to (partition, client id, boundary).
    fn resolve(&self, caller: Caller) -> Result<(PartitionId, ClientId, BoundaryToken), SpmError> {
        match caller {
            Caller::Secure(id) => match self.record(id) {
                Some(record) if !record.desc.ns_agent => Ok((id, id.client_id(), record.token)),
                _ => Err(SpmError::UnknownCaller(caller)),
            },
            Caller::NonSecure(client) if is_ns_client(client) => {
                let agent = self.ns_agent.ok_or(SpmError::UnknownCaller(caller))?;
                let record = self.record(agent).ok_or(SpmError::UnknownCaller(caller))?;
                Ok((agent, client, record.token))
            }
            Caller::NonSecure(_) => Err(SpmError::UnknownCaller(caller)),
        }
    }

    fn permitted(&self, caller: Caller, service: &ServiceDescriptor) -> bool {
        match caller {
            Caller::Secure(id) => self.record(id).is_some_and(|r| r.desc.dependencies.contains(&service.sid)),
            Caller::NonSecure(_) => service.non_secure_clients,
        }
    }

    fn check_policy(&self, caller: Caller, client: ClientId, service: &ServiceDescriptor, requested: u32) -> Result<(), SpmError> {
        if !self.permitted(caller, service) {
            return Err(SpmError::AccessDenied { client, sid: service.sid });
        }
        if !service.accepts_version(requested) {
            return Err(SpmError::Version { sid: service.sid, requested });
        }
        Ok(())
    }

    /// Version of `sid` as visible to `caller`, or `PSA_VERSION_NONE`.
    pub fn version(&self, caller: Caller, sid: Sid) -> u32 {
        if self.resolve(caller).is_err() {
            return PSA_VERSION_NONE;
        }
        match self.services.lookup(sid) {
            Some(service) if self.permitted(caller, service) => service.version,
            _ => PSA_VERSION_NONE,
        }
    }

    /// Opens a session with stateful service `sid`. The service accepts or refuses in its reply.
    pub fn connect(&mut self, caller: Caller, sid: Sid, version: u32) -> Result<Pending, SpmError> {
        let result = self.connect_inner(caller, sid, version);
        if let Err(err) = &result {
            log::warn!(target: "spm::call", "connect rejected caller={:?} sid={:#x}: {}", caller, sid, err);
        }
        result
    }

    fn connect_inner(&mut self, caller: Caller, sid: Sid, version: u32) -> Result<Pending, SpmError> {
        let (pid, client, token) = self.resolve(caller)?;
        let service = self.services.lookup(sid).ok_or(SpmError::UnknownService(sid))?;
        if service.stateless {
            return Err(SpmError::Stateless(sid));
        }
        self.check_policy(caller, client, service, version)?;
        let host = service.partition;
        self.locked(|spm| {
            let id = spm.conns.open_session(Connection::new(sid, pid, client, token)).map_err(SpmError::Conn)?;
            spm.conns.transition(id, ConnState::Marshalling).map_err(SpmError::Conn)?;
            spm.dispatch(id, MessageKind::Connect, host)?;
            Ok(Pending { conn: id, caller: pid, client })
        })
    }

    /// Sends a request on `handle` with vectors described by `ctrl`, `in_desc` and `out_desc`.
    pub fn call(&mut self, caller: Caller, handle: Handle, ctrl: u32, in_desc: u32, out_desc: u32) -> Result<Pending, SpmError> {
        let result = self.call_inner(caller, handle, ctrl, in_desc, out_desc);
        if let Err(err) = &result {
            log::warn!(target: "spm::call", "call rejected caller={:?} handle={:#x}: {}", caller, handle, err);
        }
        result
    }

    fn call_inner(&mut self, caller: Caller, handle: Handle, ctrl: u32, in_desc: u32, out_desc: u32) -> Result<Pending, SpmError> {
        let ctrl = ControlWord::unpack(ctrl).map_err(SpmError::Control)?;
        let (pid, client, token) = self.resolve(caller)?;

        let stateless_sid = match HandleKind::classify(handle) {
            HandleKind::Stateless { index, version } => {
                let service = self.services.stateless(index).ok_or(SpmError::InvalidHandle(handle))?;
                self.check_policy(caller, client, service, version as u32)?;
                Some(service.sid)
            }
            HandleKind::Stateful(_) => None,
            HandleKind::Null | HandleKind::Invalid => return Err(SpmError::InvalidHandle(handle)),
        };

        self.locked(|spm| {
            let id = spm
                .conns
                .get_connection(handle, client, |_, _| {
                    stateless_sid.map(|sid| Connection::new(sid, pid, client, token)).ok_or(ConnError::NotFound)
                })
                .map_err(|err| match err {
                    ConnError::NotFound => SpmError::InvalidHandle(handle),
                    other => SpmError::Conn(other),
                })?;
            if id.pool() == PoolKind::Session {
                spm.conns.transition(id, ConnState::Marshalling).map_err(SpmError::Conn)?;
            }

            let conn = spm.conns.get_mut(id).map_err(SpmError::Conn)?;
            let sid = conn.service();
            if let Err(err) = iovec::marshal(conn, &ctrl, in_desc, out_desc, &spm.regions, &spm.mem) {
                spm.abort(id);
                return Err(SpmError::Marshal(err));
            }
            let host = match spm.services.lookup(sid) {
                Some(service) => service.partition,
                None => {
                    spm.abort(id);
                    return Err(SpmError::UnknownService(sid));
                }
            };
            spm.dispatch(id, MessageKind::Call(ctrl.call_type()), host)?;
            Ok(Pending { conn: id, caller: pid, client })
        })
    }

    /// Closes a session. Closing the null handle does nothing.
    pub fn close(&mut self, caller: Caller, handle: Handle) -> Result<Option<Pending>, SpmError> {
        let result = self.close_inner(caller, handle);
        if let Err(err) = &result {
            log::warn!(target: "spm::call", "close rejected caller={:?} handle={:#x}: {}", caller, handle, err);
        }
        result
    }

    fn close_inner(&mut self, caller: Caller, handle: Handle) -> Result<Option<Pending>, SpmError> {
        match HandleKind::classify(handle) {
            HandleKind::Null => return Ok(None),
            HandleKind::Stateful(_) => {}
            HandleKind::Stateless { .. } | HandleKind::Invalid => return Err(SpmError::InvalidHandle(handle)),
        }
        let (pid, client, _) = self.resolve(caller)?;
        self.locked(|spm| {
            let id = spm.conns.session(handle, client).map_err(|_| SpmError::InvalidHandle(handle))?;
            spm.conns.transition(id, ConnState::Marshalling).map_err(SpmError::Conn)?;
            let sid = spm.conns.get(id).map_err(SpmError::Conn)?.service();
            let Some(host) = spm.services.lookup(sid).map(|s| s.partition) else {
                spm.abort(id);
                return Err(SpmError::UnknownService(sid));
            };
            spm.dispatch(id, MessageKind::Disconnect, host)?;
            Ok(Some(Pending { conn: id, caller: pid, client }))
        })
    }

    /// Queues a marshalled request and wakes its service. Aborts the request on failure.
    fn dispatch(&mut self, id: ConnId, kind: MessageKind, host: PartitionId) -> Result<(), SpmError> {
        let (sid, client, caller) = {
            let conn = self.conns.get_mut(id).map_err(SpmError::Conn)?;
            conn.request = Some(kind);
            (conn.service(), conn.client(), conn.caller())
        };
        if let Err(err) = self.backend.dispatch(Message { conn: id, sid, client, kind }) {
            self.abort(id);
            return Err(SpmError::Ipc(err));
        }
        self.conns.transition(id, ConnState::Dispatched).map_err(SpmError::Conn)?;
        log::debug!(target: "spm::call", "dispatch {:?} {:?} sid={:#x} client={}", id, kind, sid, client);
        self.block(caller);
        self.wake(host);
        Ok(())
    }

    /// Backs a request out of `Marshalling`: stateless leases are released, sessions go idle
    /// (a refused `connect` never produced a session, so it is released too).
    fn abort(&mut self, id: ConnId) {
        let opening = self.conns.get(id).is_ok_and(|c| c.request() == Some(MessageKind::Connect));
        let released = if id.pool() == PoolKind::Stateless || opening {
            self.conns.free_connection(id).map(|_| ())
        } else {
            self.conns.transition(id, ConnState::Idle)
        };
        if let Err(err) = released {
            log::error!(target: "spm::call", "abort {:?} failed: {}", id, err);
        }
    }

    // ---- service side ------------------------------------------------------------------

    fn token(&self, id: PartitionId) -> Result<BoundaryToken, SpmError> {
        self.record(id).map(|r| r.token).ok_or(SpmError::UnknownPartition(id))
    }

    /// Checks that `msg` is in flight and addressed to a service of `partition`.
    fn serviced(&self, partition: PartitionId, msg: ConnId) -> Result<&Connection, SpmError> {
        let conn = self.conns.get(msg).map_err(SpmError::Conn)?;
        match self.services.lookup(conn.service()) {
            Some(service) if service.partition == partition => {}
            _ => return Err(SpmError::NotOwner(partition)),
        }
        if conn.state() != ConnState::Dispatched {
            return Err(SpmError::NotDispatched);
        }
        Ok(conn)
    }

    /// Takes the next message for service `sid` hosted by `partition`.
    pub fn get(&mut self, partition: PartitionId, sid: Sid) -> Result<Option<MessageInfo>, SpmError> {
        match self.services.lookup(sid) {
            Some(service) if service.partition == partition => {}
            Some(_) => return Err(SpmError::NotOwner(partition)),
            None => return Err(SpmError::UnknownService(sid)),
        }
        let Some(msg) = self.backend.fetch(sid) else {
            return Ok(None);
        };
        let conn = self.serviced(partition, msg.conn)?;
        let vectors = conn.vectors();
        let mut info = MessageInfo {
            handle: msg.conn,
            sid,
            kind: msg.kind,
            client: msg.client,
            in_size: [0; PSA_MAX_IOVEC],
            out_size: [0; PSA_MAX_IOVEC],
            rhandle: conn.rhandle(),
        };
        for (size, vec) in info.in_size.iter_mut().zip(vectors.inputs()) {
            *size = vec.len();
        }
        for (size, vec) in info.out_size.iter_mut().zip(vectors.outputs()) {
            *size = vec.len();
        }
        Ok(Some(info))
    }

    /// Copies up to `len` unread bytes of input `idx` into service memory at `dst`.
    pub fn read(&mut self, partition: PartitionId, msg: ConnId, idx: usize, dst: u32, len: u32) -> Result<u32, SpmError> {
        let token = self.token(partition)?;
        let remaining = self.serviced(partition, msg)?.vectors().remaining(idx).ok_or(SpmError::NoSuchVector(idx))?;
        let n = remaining.min(len);
        isolation::check_verified(&self.regions, token, dst, n, AccessFlags::read_write(false))
            .map_err(|_| SpmError::ServiceBuffer(Region::new(dst, n)))?;
        let conn = self.conns.get_mut(msg).map_err(SpmError::Conn)?;
        let Some((src, n)) = conn.vectors.input_cursor(idx, n) else {
            return Err(SpmError::NoSuchVector(idx));
        };
        self.mem.copy(src, dst, n).map_err(SpmError::Bus)?;
        conn.vectors.consume_input(idx, n);
        Ok(n)
    }

    /// Discards up to `len` unread bytes of input `idx`.
    pub fn skip(&mut self, partition: PartitionId, msg: ConnId, idx: usize, len: u32) -> Result<u32, SpmError> {
        self.serviced(partition, msg)?;
        let conn = self.conns.get_mut(msg).map_err(SpmError::Conn)?;
        conn.vectors.take_input(idx, len).map(|(_, n)| n).ok_or(SpmError::NoSuchVector(idx))
    }

    /// Appends `len` bytes from service memory at `src` to output `idx`.
    pub fn write(&mut self, partition: PartitionId, msg: ConnId, idx: usize, src: u32, len: u32) -> Result<(), SpmError> {
        let token = self.token(partition)?;
        let conn = self.serviced(partition, msg)?;
        if idx >= conn.vectors().outputs().len() {
            return Err(SpmError::NoSuchVector(idx));
        }
        isolation::check_verified(&self.regions, token, src, len, AccessFlags::read(false))
            .map_err(|_| SpmError::ServiceBuffer(Region::new(src, len)))?;
        let conn = self.conns.get_mut(msg).map_err(SpmError::Conn)?;
        let dst = conn.vectors.output_cursor(idx, len).ok_or(SpmError::OutputOverflow { idx, len })?;
        self.mem.copy(src, dst, len).map_err(SpmError::Bus)?;
        conn.vectors.commit_output(idx, len);
        Ok(())
    }

    /// Attaches a service-private value to the session of `msg`.
    pub fn set_rhandle(&mut self, partition: PartitionId, msg: ConnId, rhandle: usize) -> Result<(), SpmError> {
        let sid = self.serviced(partition, msg)?.service();
        if msg.pool() != PoolKind::Session {
            return Err(SpmError::Stateless(sid));
        }
        self.conns.get_mut(msg).map_err(SpmError::Conn)?.rhandle = Some(rhandle);
        Ok(())
    }

    /// Completes `msg` with `status` and wakes the caller.
    pub fn reply(&mut self, partition: PartitionId, msg: ConnId, status: Status) -> Result<Completion, SpmError> {
        let conn = self.serviced(partition, msg)?;
        let kind = conn.request().ok_or(SpmError::NotDispatched)?;
        let valid = match kind {
            MessageKind::Call(_) => is_valid_call_reply(status),
            MessageKind::Connect => status == PSA_SUCCESS || status == PSA_ERROR_CONNECTION_REFUSED,
            MessageKind::Disconnect => true,
        };
        if !valid {
            log::warn!(target: "spm::call", "reply {:?} with reserved status {}", msg, status);
            return Err(SpmError::InvalidReply(status));
        }
        self.locked(|spm| spm.complete(msg, kind, status))
    }

    fn complete(&mut self, msg: ConnId, kind: MessageKind, status: Status) -> Result<Completion, SpmError> {
        self.conns.transition(msg, ConnState::Completing).map_err(SpmError::Conn)?;
        let conn = self.conns.get(msg).map_err(SpmError::Conn)?;
        let (caller, client) = (conn.caller(), conn.client());
        let reply_vec = conn.vectors().reply_vec();
        let outputs = conn.vectors().outputs().len();
        let mut written = [0u32; PSA_MAX_IOVEC];
        for (i, len) in written.iter_mut().enumerate().take(outputs) {
            *len = conn.vectors().written(i);
        }

        let (status, handle) = match kind {
            MessageKind::Call(_) => {
                if let Some(reply_vec) = reply_vec {
                    for (i, len) in written.iter().enumerate().take(outputs) {
                        let at = reply_vec + (i * RawIoVec::SIZE) as u32 + RawIoVec::LEN_OFFSET;
                        if self.mem.write_u32(at, *len).is_err() {
                            fatal(Fatal::ReplyWriteBack(at));
                        }
                    }
                }
                self.finish(msg);
                (status, None)
            }
            MessageKind::Connect if status == PSA_SUCCESS => {
                self.conns.transition(msg, ConnState::Idle).map_err(SpmError::Conn)?;
                (PSA_SUCCESS, self.conns.session_handle(msg))
            }
            MessageKind::Connect => {
                self.conns.free_connection(msg).map_err(SpmError::Conn)?;
                (PSA_ERROR_CONNECTION_REFUSED, None)
            }
            MessageKind::Disconnect => {
                self.conns.free_connection(msg).map_err(SpmError::Conn)?;
                (PSA_SUCCESS, None)
            }
        };
        log::debug!(target: "spm::call", "complete {:?} {:?} status={}", msg, kind, status);
        self.wake(caller);
        Ok(Completion { conn: msg, caller, client, status, handle })
    }

    /// Ends a call: stateless leases are freed, sessions return to idle.
    fn finish(&mut self, msg: ConnId) {
        let done = match msg.pool() {
            PoolKind::Stateless => self.conns.free_connection(msg).map(|_| ()),
            PoolKind::Session => self.conns.transition(msg, ConnState::Idle),
        };
        if let Err(err) = done {
            log::error!(target: "spm::call", "finish {:?} failed: {}", msg, err);
        }
    }

    // ---- scheduling ----------------------------------------------------------------------

    /// The running partition waits for messages or replies.
    pub fn wait(&mut self, partition: PartitionId) {
        self.locked(|spm| {
            spm.block(partition);
            let _ = spm.lock.request_reschedule(&mut spm.arch);
        });
    }

    /// The running partition stays runnable but lets equal-priority partitions go first.
    pub fn yield_now(&mut self) {
        self.locked(|spm| {
            spm.sched.yield_current();
            let _ = spm.lock.request_reschedule(&mut spm.arch);
        });
    }

    /// Records the stack pointer of the outgoing thread, as saved by the switch handler.
    pub fn save_context(&mut self, sp: u32) {
        let Some(id) = self.running else {
            return;
        };
        if let Some(record) = self.partitions.iter_mut().find(|p| p.desc.id == id) {
            if let Some(ctx) = record.context.as_mut() {
                ctx.set_sp(sp);
            }
        }
    }

    /// Picks the next partition and loads its boundary and stack.
    pub fn schedule(&mut self) -> Option<SwitchInfo> {
        self.locked(|spm| spm.schedule_locked())
    }

    fn schedule_locked(&mut self) -> Option<SwitchInfo> {
        let next = self.sched.schedule_next()?;
        if self.running == Some(next) {
            return None;
        }
        let record = self.record(next)?;
        let to_token = record.token;
        let Some(ctx) = record.context else {
            log::warn!(target: "spm::sched", "partition={} has no thread", next);
            self.sched.purge(next);
            return None;
        };
        let from_token = self.running.and_then(|id| self.boundaries.token_of(id));
        let boundary_switched = from_token.map_or(true, |from| boundary::needs_switch(from, to_token));
        if boundary_switched {
            self.boundaries.activate(&mut self.arch, next, to_token);
        } else if let Some(from) = from_token {
            boundary::reload_named_regions(&mut self.arch, from, to_token);
        }
        let exc_return = arch::refresh_hardware_context(&mut self.arch, &ctx);
        let from = self.running.replace(next);
        log::trace!(target: "spm::sched", "switch {:?} -> {} boundary={}", from, next, boundary_switched);
        Some(SwitchInfo { from, to: next, exc_return, boundary_switched })
    }
}
