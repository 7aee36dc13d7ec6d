//! Per-thread work queues implementing a completion-passing idiom: every
//! cross-zone request is an explicit message carrying an opaque payload and
//! a typed completion handle, never a shared lock.
//!
//! Each zone's `BlockAllocator` is owned exclusively by one `tokio::task`;
//! every other task (another zone, the admin thread, the journal zone)
//! interacts with it only by sending a `ZoneMessage` and awaiting the
//! completion it carries, bouncing state between tasks via
//! `tokio::sync::{mpsc, oneshot}` rather than sharing a lock across threads.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::admin::ZoneAction;
use crate::block_allocator::{BlockAllocator, Waiter};
use crate::error::Result;
use crate::types::{Pbn, ZoneNumber};

/// A message posted to a zone's work queue. Every variant carries its own
/// completion handle; the zone task never blocks on anything but receiving
/// from its queue.
pub enum ZoneMessage {
    Allocate {
        reply: oneshot::Sender<Result<Pbn>>,
    },
    ReleaseUnconfirmed {
        pbn: Pbn,
        reply: oneshot::Sender<Result<()>>,
    },
    Confirm {
        pbn: Pbn,
        op: crate::types::ReferenceOperation,
        recovery_block: u64,
        reply: oneshot::Sender<Result<(crate::types::SlabNumber, crate::types::SequenceNumber, u64)>>,
    },
    RunAction {
        action: ZoneAction,
        reply: oneshot::Sender<Result<()>>,
    },
    ScrubOne {
        reply: oneshot::Sender<Result<bool>>,
    },
    QueueSlab {
        local_index: usize,
        reply: oneshot::Sender<()>,
    },
    ApplyLoadClassification {
        dirty: Vec<usize>,
        clean: Vec<usize>,
        reply: oneshot::Sender<()>,
    },
    EnqueueWaiter {
        token: u64,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<i64>,
    },
    AppendSlabs {
        slabs: Vec<crate::slab::Slab>,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// A handle other tasks use to talk to a zone. Cheap to clone; the zone
/// state it addresses is never touched off-thread.
#[derive(Clone)]
pub struct ZoneHandle {
    zone_number: ZoneNumber,
    sender: mpsc::Sender<ZoneMessage>,
}

impl ZoneHandle {
    pub fn zone_number(&self) -> ZoneNumber {
        self.zone_number
    }

    pub async fn allocate(&self) -> Result<Pbn> {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::Allocate { reply }).await;
        rx.await.unwrap_or(Err(crate::error::DepotError::OutOfMemory))
    }

    pub async fn release_unconfirmed(&self, pbn: Pbn) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::ReleaseUnconfirmed { pbn, reply }).await;
        rx.await.unwrap_or(Err(crate::error::DepotError::OutOfMemory))
    }

    pub async fn confirm(
        &self,
        pbn: Pbn,
        op: crate::types::ReferenceOperation,
        recovery_block: u64,
    ) -> Result<(crate::types::SlabNumber, crate::types::SequenceNumber, u64)> {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::Confirm {
            pbn,
            op,
            recovery_block,
            reply,
        })
        .await;
        rx.await.unwrap_or(Err(crate::error::DepotError::OutOfMemory))
    }

    pub async fn run_action(&self, action: ZoneAction) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::RunAction { action, reply }).await;
        rx.await.unwrap_or(Err(crate::error::DepotError::OutOfMemory))
    }

    pub async fn scrub_one(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::ScrubOne { reply }).await;
        rx.await.unwrap_or(Err(crate::error::DepotError::OutOfMemory))
    }

    /// Relaxed snapshot of this zone's `allocated_blocks` counter.
    pub async fn allocated_blocks(&self) -> i64 {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::Stats { reply }).await;
        rx.await.unwrap_or(0)
    }

    /// `queue_slab`: re-admit a slab for allocation after an external state
    /// change, addressed by its local index within this
    /// zone's dense slab array.
    pub async fn queue_slab(&self, local_index: usize) {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::QueueSlab { local_index, reply }).await;
        let _ = rx.await;
    }

    /// Apply a load-time classification: `dirty` local indices are pulled
    /// off the allocation path and queued for scrubbing; `clean` local
    /// indices (including never-written slabs) are admitted for allocation.
    pub async fn apply_load_classification(&self, dirty: Vec<usize>, clean: Vec<usize>) {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::ApplyLoadClassification { dirty, clean, reply })
            .await;
        let _ = rx.await;
    }

    /// Park a waiter, identified by an opaque `token`, on this zone's
    /// "waiting for clean slab" list.
    pub async fn enqueue_waiter(&self, token: u64) {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::EnqueueWaiter { token, reply }).await;
        let _ = rx.await;
    }

    pub async fn append_slabs(&self, slabs: Vec<crate::slab::Slab>) {
        let (reply, rx) = oneshot::channel();
        self.send(ZoneMessage::AppendSlabs { slabs, reply }).await;
        let _ = rx.await;
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ZoneMessage::Shutdown).await;
    }

    async fn send(&self, message: ZoneMessage) {
        if self.sender.send(message).await.is_err() {
            warn!(zone = self.zone_number, "zone task is gone; dropping message");
        }
    }
}

const WORK_QUEUE_CAPACITY: usize = 256;

/// Spawn a zone's event loop as its own task and return a handle to it. The
/// allocator is moved into the task; nothing outside this function ever
/// touches it again directly, which is what makes the single-owner-per-zone
/// invariant structural rather than merely a convention.
pub fn spawn_zone_task(mut allocator: BlockAllocator) -> (ZoneHandle, tokio::task::JoinHandle<()>) {
    let zone_number = allocator.zone_number;
    let (tx, mut rx) = mpsc::channel(WORK_QUEUE_CAPACITY);

    let join = tokio::spawn(async move {
        let span = tracing::info_span!("zone", zone = zone_number);
        let _enter = span.enter();
        debug!("zone task starting");
        while let Some(message) = rx.recv().await {
            match message {
                ZoneMessage::Allocate { reply } => {
                    let _ = reply.send(allocator.allocate_block());
                }
                ZoneMessage::ReleaseUnconfirmed { pbn, reply } => {
                    let _ = reply.send(allocator.release_unconfirmed(pbn));
                }
                ZoneMessage::Confirm {
                    pbn,
                    op,
                    recovery_block,
                    reply,
                } => {
                    let _ = reply.send(allocator.confirm_allocation(pbn, op, recovery_block));
                }
                ZoneMessage::RunAction { action, reply } => {
                    let _ = reply.send(run_zone_action(&mut allocator, action));
                }
                ZoneMessage::ScrubOne { reply } => {
                    let outcome = allocator.scrub_one().map(|opt| opt.is_some());
                    if let Ok(true) = &outcome {
                        if let Some(waiter) = allocator.wake_one_waiter() {
                            debug!(token = waiter.token, "woke waiter after scrub");
                        }
                    }
                    let _ = reply.send(outcome);
                }
                ZoneMessage::Stats { reply } => {
                    let _ = reply.send(allocator.allocated_blocks());
                }
                ZoneMessage::QueueSlab { local_index, reply } => {
                    allocator.queue_slab(local_index);
                    let _ = reply.send(());
                }
                ZoneMessage::ApplyLoadClassification { dirty, clean, reply } => {
                    allocator.apply_load_classification(&dirty, &clean);
                    let _ = reply.send(());
                }
                ZoneMessage::EnqueueWaiter { token, reply } => {
                    allocator.enqueue_waiter_for_clean_slab(Waiter { token });
                    let _ = reply.send(());
                }
                ZoneMessage::AppendSlabs { slabs, reply } => {
                    allocator.append_slabs(slabs);
                    let _ = reply.send(());
                }
                ZoneMessage::Shutdown => {
                    debug!("zone task shutting down");
                    break;
                }
            }
        }
    });

    (
        ZoneHandle {
            zone_number,
            sender: tx,
        },
        join,
    )
}

fn run_zone_action(allocator: &mut BlockAllocator, action: ZoneAction) -> Result<()> {
    match action {
        ZoneAction::Drain => {
            allocator.admin_state = allocator
                .admin_state
                .transition(crate::admin::AdminState::Suspending)?;
            allocator.admin_state = allocator
                .admin_state
                .transition(crate::admin::AdminState::Suspended)?;
            Ok(())
        }
        ZoneAction::Resume => {
            allocator.admin_state = allocator
                .admin_state
                .transition(crate::admin::AdminState::Resuming)?;
            allocator.admin_state = allocator
                .admin_state
                .transition(crate::admin::AdminState::Normal)?;
            Ok(())
        }
        ZoneAction::LoadNormal | ZoneAction::LoadRecovery | ZoneAction::LoadRebuild => {
            // Per-slab classification (dirty vs clean, scrubber enqueue vs
            // allocation queue) is dispatched separately as
            // `ApplyLoadClassification`, before this fans out, because it
            // needs the summary that only `depot::SlabDepot::load` has in
            // scope. This action just flips the admin state.
            Ok(())
        }
        ZoneAction::PrepareToAllocate => {
            if allocator.scrubber.high_priority_queue_empty() {
                Ok(())
            } else {
                Err(crate::error::DepotError::Quiescent)
            }
        }
        ZoneAction::Scrub => allocator.scrub_one().map(|_| ()),
        ZoneAction::Grow => Ok(()),
        ZoneAction::ReleaseTailLocks { recovery_block } => {
            for i in 0..allocator.slab_count() {
                allocator
                    .slab_mut(i)
                    .journal
                    .commit_dirty_tail_blocks_locking_recovery_block(recovery_block)?;
            }
            Ok(())
        }
    }
}
