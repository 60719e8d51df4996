// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Priority run queues for partition threads
//! OWNERS: @spm-team
//! PUBLIC API: Scheduler (new/try_enqueue/schedule_next/yield_current/block_current/purge),
//!             Priority, EnqueueOutcome
//! DEPENDS_ON: types::PartitionId
//! INVARIANTS: Bounded queue capacity + deterministic reject on saturation; a partition is queued at
//!             most once; round robin within a priority

use alloc::collections::VecDeque;
use core::marker::PhantomData;

use serde::Deserialize;

use crate::types::PartitionId;

/// Partition priority.
///
/// Discriminants index the run-queue array; new variants must be appended.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Priority {
    const DESCENDING: [Priority; 4] = [Priority::High, Priority::Normal, Priority::Low, Priority::Lowest];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Thread {
    id: PartitionId,
    priority: Priority,
}

/// Per-priority queue capacity.
pub const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    QueueFull { priority: Priority, capacity: usize },
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Already queued or running; nothing changed.
    AlreadyRunnable,
    Rejected(EnqueueRejectReason),
}

/// Round-robin scheduler with strict priority between classes.
///
/// `!Send` and `!Sync`: owned by the SPM and only touched under its scheduler lock.
pub struct Scheduler {
    queues: [VecDeque<Thread>; 4],
    current: Option<Thread>,
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queues: [
                VecDeque::with_capacity(QUEUE_CAPACITY),
                VecDeque::with_capacity(QUEUE_CAPACITY),
                VecDeque::with_capacity(QUEUE_CAPACITY),
                VecDeque::with_capacity(QUEUE_CAPACITY),
            ],
            current: None,
            _not_send_sync: PhantomData,
        }
    }

    fn queue_for(&mut self, priority: Priority) -> &mut VecDeque<Thread> {
        &mut self.queues[priority as usize]
    }

    fn is_runnable(&self, id: PartitionId) -> bool {
        self.current.is_some_and(|t| t.id == id) || self.queues.iter().flatten().any(|t| t.id == id)
    }

    /// Makes `id` runnable, with explicit bounded-backpressure status.
    pub fn try_enqueue(&mut self, id: PartitionId, priority: Priority) -> EnqueueOutcome {
        if self.is_runnable(id) {
            return EnqueueOutcome::AlreadyRunnable;
        }
        let queue = self.queue_for(priority);
        if queue.len() >= QUEUE_CAPACITY {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull {
                priority,
                capacity: QUEUE_CAPACITY,
            });
        }
        queue.push_back(Thread { id, priority });
        log::trace!(target: "spm::sched", "enqueue partition={} prio={:?}", id, priority);
        EnqueueOutcome::Enqueued
    }

    /// Picks the next thread. A running thread that was neither yielded nor blocked keeps
    /// the CPU unless a higher priority thread is waiting.
    pub fn schedule_next(&mut self) -> Option<PartitionId> {
        let floor = self.current.map(|t| t.priority);
        for class in Priority::DESCENDING {
            if floor.is_some_and(|p| class <= p) {
                break;
            }
            if let Some(thread) = self.queue_for(class).pop_front() {
                if let Some(preempted) = self.current.take() {
                    // Preempted threads go back to the front of their class.
                    self.queue_for(preempted.priority).push_front(preempted);
                }
                self.current = Some(thread);
                return Some(thread.id);
            }
        }
        self.current.map(|t| t.id)
    }

    /// Re-enqueues the running thread behind its peers.
    pub fn yield_current(&mut self) {
        if let Some(thread) = self.current.take() {
            if matches!(self.try_enqueue(thread.id, thread.priority), EnqueueOutcome::Rejected(_)) {
                // Fail closed: keep it running rather than drop it.
                self.current = Some(thread);
            }
        }
    }

    /// The running thread waits for an event and leaves the CPU.
    pub fn block_current(&mut self) {
        self.current = None;
    }

    /// Removes every reference to `id`.
    pub fn purge(&mut self, id: PartitionId) {
        for q in &mut self.queues {
            q.retain(|t| t.id != id);
        }
        if self.current.is_some_and(|t| t.id == id) {
            self.current = None;
        }
    }

    pub fn current(&self) -> Option<PartitionId> {
        self.current.map(|t| t.id)
    }
}
