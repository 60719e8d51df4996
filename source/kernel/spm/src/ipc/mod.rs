// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Delivery of validated requests to services.
//!
//! The SPM front end never talks to a service queue directly; it hands a [`Message`] to a
//! [`MessagingBackend`]. [`Router`] is the in-SPM backend with one bounded FIFO per service.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use psa_abi::{CallType, ClientId, Sid, PSA_IPC_CONNECT, PSA_IPC_DISCONNECT};
use thiserror::Error;

use crate::conn::ConnId;

/// Error returned by backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("service {0:#x} has no endpoint")]
    NoSuchService(Sid),
    #[error("service {0:#x} already has an endpoint")]
    AlreadyRegistered(Sid),
    #[error("queue of service {0:#x} is full")]
    QueueFull(Sid),
}

/// What the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Connect,
    Call(CallType),
    Disconnect,
}

impl MessageKind {
    /// Message type as reported to the service.
    pub const fn type_code(self) -> i32 {
        match self {
            MessageKind::Connect => PSA_IPC_CONNECT,
            MessageKind::Call(ty) => ty.as_raw(),
            MessageKind::Disconnect => PSA_IPC_DISCONNECT,
        }
    }
}

/// A request waiting for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub conn: ConnId,
    pub sid: Sid,
    pub client: ClientId,
    pub kind: MessageKind,
}

/// Transport between the front end and services.
pub trait MessagingBackend {
    /// Creates the endpoint of `sid`.
    fn register(&mut self, sid: Sid) -> Result<(), IpcError>;

    /// Queues `msg` for its service.
    fn dispatch(&mut self, msg: Message) -> Result<(), IpcError>;

    /// Takes the oldest message for `sid`.
    fn fetch(&mut self, sid: Sid) -> Option<Message>;

    /// Messages waiting for `sid`.
    fn pending(&self, sid: Sid) -> usize;
}

/// Representation of an endpoint queue.
struct Endpoint {
    sid: Sid,
    queue: VecDeque<Message>,
    depth: usize,
}

impl Endpoint {
    fn with_depth(sid: Sid, depth: usize) -> Self {
        Self { sid, queue: VecDeque::with_capacity(depth), depth }
    }

    fn push(&mut self, msg: Message) -> Result<(), IpcError> {
        if self.queue.len() >= self.depth {
            return Err(IpcError::QueueFull(self.sid));
        }
        self.queue.push_back(msg);
        Ok(())
    }
}

/// Router managing one queue per service.
pub struct Router {
    endpoints: Vec<Endpoint>,
    depth: usize,
}

impl Router {
    /// Creates a router whose queues hold `depth` messages each.
    pub fn new(depth: usize) -> Self {
        Self { endpoints: Vec::new(), depth }
    }

    fn endpoint_mut(&mut self, sid: Sid) -> Result<&mut Endpoint, IpcError> {
        self.endpoints.iter_mut().find(|e| e.sid == sid).ok_or(IpcError::NoSuchService(sid))
    }
}

impl MessagingBackend for Router {
    fn register(&mut self, sid: Sid) -> Result<(), IpcError> {
        if self.endpoints.iter().any(|e| e.sid == sid) {
            return Err(IpcError::AlreadyRegistered(sid));
        }
        self.endpoints.push(Endpoint::with_depth(sid, self.depth));
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) -> Result<(), IpcError> {
        self.endpoint_mut(msg.sid)?.push(msg)
    }

    fn fetch(&mut self, sid: Sid) -> Option<Message> {
        self.endpoint_mut(sid).ok()?.queue.pop_front()
    }

    fn pending(&self, sid: Sid) -> usize {
        self.endpoints.iter().find(|e| e.sid == sid).map_or(0, |e| e.queue.len())
    }
}
