// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ITS_CMD_SIZE, ItsCommand};
use crate::error_ratelimited;
use crate::hw::regs::*;
use crate::hw::{DmaBuffer, DmaError, DmaMemory, ItsMmio};
use crate::logger::{IncMetric, ItsMetrics, LogRateLimit, debug, extract_guard, info};
use crate::utils::{Backoff, SZ_4K, SZ_64K, u64_to_usize, usize_to_u64};

/// Errors associated with the command queue.
#[derive(Debug, Clone, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum QueueError {
    /// ITS command queue full: the hardware did not consume commands in time
    QueueFull,
    /// Timed out waiting for the ITS to process commands up to slot {0}
    Timeout(u32),
    /// Invalid command queue size {0:#x}
    InvalidSize(usize),
    /// Cannot allocate the command queue: {0}
    Dma(#[from] DmaError),
}

#[derive(Debug)]
struct QueueState {
    // Commands written to the ring since it was set up. The next slot to fill is this
    // modulo the ring size.
    enqueued: u64,
    // Commands handed to the hardware through GITS_CWRITER.
    posted: u64,
}

impl QueueState {
    fn write_slot(&self, nr_slots: u32) -> u32 {
        // The remainder is below `nr_slots`.
        (self.enqueued % u64::from(nr_slots)) as u32
    }
}

/// Proof that some commands have been handed to the hardware, to be waited upon with
/// [`CommandQueue::wait_for_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    // Number of commands posted once the covered ones were.
    seq: u64,
    // Slot following the last covered command.
    to: u32,
}

/// The command ring of one ITS.
///
/// Producers serialize on an internal lock (see [`CommandQueue::lock`]); the hardware
/// consumes commands asynchronously and reports progress through GITS_CREADR.
#[derive(Debug)]
pub struct CommandQueue {
    mmio: Arc<dyn ItsMmio>,
    ring: DmaBuffer,
    nr_slots: u32,
    needs_flushing: bool,
    backoff: Backoff,
    state: Mutex<QueueState>,
    degraded: AtomicBool,
    metrics: Arc<ItsMetrics>,
    log_limit: LogRateLimit,
}

impl CommandQueue {
    /// Allocates a ring of `size` bytes and programs GITS_CBASER/GITS_CWRITER.
    ///
    /// The ITS must be disabled and quiescent.
    pub fn new(
        mmio: Arc<dyn ItsMmio>,
        memory: &Arc<dyn DmaMemory>,
        size: usize,
        backoff: Backoff,
        metrics: Arc<ItsMetrics>,
    ) -> Result<Self, QueueError> {
        if size == 0 || size % SZ_4K != 0 || size / SZ_4K > 256 {
            return Err(QueueError::InvalidSize(size));
        }
        let ring = DmaBuffer::zeroed(memory, size, SZ_64K)?;

        let mut baser = (ring.phys() & GITS_CBASER_PA_MASK)
            | GITS_CBASER_RAWAWB
            | GITS_CBASER_INNER_SHAREABLE
            | usize_to_u64(size / SZ_4K - 1)
            | GITS_CBASER_VALID;
        mmio.write(GITS_CBASER, baser);
        let readback = mmio.read(GITS_CBASER);

        let mut needs_flushing = false;
        if (readback ^ baser) & GITS_CBASER_SHAREABILITY_MASK != 0 {
            if readback & GITS_CBASER_SHAREABILITY_MASK == 0 {
                // The hardware can only do non-shareable: make the ring non-cacheable too.
                baser &= !(GITS_CBASER_SHAREABILITY_MASK | GITS_CBASER_CACHEABILITY_MASK);
                baser |= GITS_CBASER_NC;
                mmio.write(GITS_CBASER, baser);
            }
            info!("ITS@{:#x}: using cache flushing for cmd queue", mmio.phys_base());
            needs_flushing = true;
        }
        if needs_flushing {
            ring.flush();
        }
        mmio.write(GITS_CWRITER, 0);

        Ok(CommandQueue {
            mmio,
            ring,
            nr_slots: u32::try_from(size / ITS_CMD_SIZE).map_err(|_| QueueError::InvalidSize(size))?,
            needs_flushing,
            backoff,
            state: Mutex::new(QueueState {
                enqueued: 0,
                posted: 0,
            }),
            degraded: AtomicBool::new(false),
            metrics,
            log_limit: LogRateLimit::default(),
        })
    }

    /// Number of command slots in the ring. At most `capacity() - 1` can be outstanding.
    pub fn capacity(&self) -> u32 {
        self.nr_slots
    }

    /// Whether commands have to be cleaned to the point of coherency.
    pub fn needs_flushing(&self) -> bool {
        self.needs_flushing
    }

    /// Physical address of the ring.
    pub fn ring_phys(&self) -> u64 {
        self.ring.phys()
    }

    /// Set once a wait on this queue has been abandoned. The ITS should then be considered
    /// unusable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Takes the producer lock.
    pub fn lock(&self) -> CommandQueueGuard<'_> {
        CommandQueueGuard {
            queue: self,
            state: extract_guard(self.state.lock()),
        }
    }

    fn read_slot(&self) -> u32 {
        let offset = self.mmio.read(GITS_CREADR) & GITS_CMDQ_OFFSET_MASK;
        // The offset is below the ring size.
        (u64_to_usize(offset) / ITS_CMD_SIZE) as u32
    }

    fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Number of posted commands the hardware has consumed so far.
    ///
    /// At most `capacity() - 1` commands are ever outstanding, so the distance from
    /// GITS_CREADR to GITS_CWRITER tells how many posted commands are still pending, however
    /// many times the ring wrapped in between.
    fn consumed(&self) -> u64 {
        let state = extract_guard(self.state.lock());
        let nr_slots = u64::from(self.nr_slots);
        let rd = u64::from(self.read_slot());
        let wr = state.posted % nr_slots;
        state.posted - (wr + nr_slots - rd) % nr_slots
    }

    /// Waits until the hardware has consumed every command covered by `token`.
    ///
    /// Must not be called with the producer lock held.
    pub fn wait_for_completion(&self, token: &CompletionToken) -> Result<(), QueueError> {
        let mut consumed = 0;
        self.backoff
            .retry(|| {
                consumed = self.consumed();
                (consumed >= token.seq).then_some(())
            })
            .map_err(|_| {
                self.metrics.completion_timeouts.inc();
                self.mark_degraded();
                error_ratelimited!(
                    self.log_limit,
                    "ITS@{:#x}: queue timeout ({} {})",
                    self.mmio.phys_base(),
                    token.seq,
                    consumed
                );
                QueueError::Timeout(token.to)
            })
    }

    /// Sends one command (and its SYNC/VSYNC) and waits for it to complete.
    pub fn send_command(&self, cmd: &ItsCommand) -> Result<(), QueueError> {
        let token = self.lock().send(cmd)?;
        self.wait_for_completion(&token)
    }
}

/// Exclusive access to the producer side of a [`CommandQueue`].
#[derive(Debug)]
pub struct CommandQueueGuard<'a> {
    queue: &'a CommandQueue,
    state: MutexGuard<'a, QueueState>,
}

impl CommandQueueGuard<'_> {
    fn is_full(&self) -> bool {
        let nr_slots = self.queue.nr_slots;
        (self.state.write_slot(nr_slots) + 1) % nr_slots == self.queue.read_slot()
    }

    /// Writes a command into the next free slot without handing it to the hardware.
    ///
    /// Waits for the hardware to free a slot when the ring is full, and fails with
    /// [`QueueError::QueueFull`] if none frees up in time.
    pub fn enqueue(&mut self, cmd: &ItsCommand) -> Result<(), QueueError> {
        let queue = self.queue;
        if self.is_full() {
            queue.metrics.queue_full_waits.inc();
            let waited = queue.backoff.retry(|| (!self.is_full()).then_some(()));
            if waited.is_err() {
                queue.metrics.queue_stalls.inc();
                queue.mark_degraded();
                error_ratelimited!(
                    queue.log_limit,
                    "ITS@{:#x}: queue not draining",
                    queue.mmio.phys_base()
                );
                return Err(QueueError::QueueFull);
            }
        }

        let slot = self.state.write_slot(queue.nr_slots);
        let offset = slot as usize * ITS_CMD_SIZE;
        let block = cmd.build();
        for (idx, dw) in block.0.iter().enumerate() {
            queue.ring.write_u64(offset + idx * 8, *dw);
        }
        // Make sure the command is visible to the ITS before it is posted.
        if queue.needs_flushing {
            queue.ring.flush_range(offset, ITS_CMD_SIZE);
        } else {
            queue.ring.memory().store_barrier();
        }
        self.state.enqueued += 1;
        Ok(())
    }

    /// Publishes every enqueued command to the hardware through GITS_CWRITER.
    pub fn post(&mut self) -> CompletionToken {
        let to = self.state.write_slot(self.queue.nr_slots);
        self.queue
            .mmio
            .write(GITS_CWRITER, u64::from(to) * usize_to_u64(ITS_CMD_SIZE));
        self.state.posted = self.state.enqueued;
        CompletionToken {
            seq: self.state.posted,
            to,
        }
    }

    /// Enqueues a command followed by the SYNC/VSYNC it requires, and posts both.
    ///
    /// If the synchronization command cannot be queued, the command itself is still posted
    /// before the error is returned.
    pub fn send(&mut self, cmd: &ItsCommand) -> Result<CompletionToken, QueueError> {
        self.enqueue(cmd)?;
        self.queue.metrics.commands_sent.inc();
        if let Some(sync) = cmd.sync_point() {
            if let Err(err) = self.enqueue(&sync.command()) {
                self.post();
                return Err(err);
            }
            self.queue.metrics.syncs_sent.inc();
        }
        debug!("ITS@{:#x}: sent {:?}", self.queue.mmio.phys_base(), cmd.opcode());
        Ok(self.post())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Opcode;
    use crate::collection::Collection;
    use crate::test_utils::{SimIts, SimItsConfig, SimMemory};

    fn setup(its_config: SimItsConfig, size: usize) -> (Arc<SimMemory>, Arc<SimIts>, CommandQueue) {
        let memory = Arc::new(SimMemory::new(its_config.shareable));
        let its = Arc::new(SimIts::new(its_config, memory.clone()));
        let dma: Arc<dyn DmaMemory> = memory.clone();
        let queue = CommandQueue::new(
            its.clone(),
            &dma,
            size,
            Backoff {
                max_iters: 100,
                delay: std::time::Duration::ZERO,
            },
            Arc::new(ItsMetrics::new()),
        )
        .unwrap();
        (memory, its, queue)
    }

    fn invall(col_id: u16) -> ItsCommand {
        ItsCommand::Invall {
            collection: Collection {
                col_id,
                target_address: 0,
            },
        }
    }

    #[test]
    fn test_cbaser_programming() {
        let (_, its, queue) = setup(SimItsConfig::default(), 0x2000);
        let cbaser = its.cbaser();
        assert_ne!(cbaser & GITS_CBASER_VALID, 0);
        assert_eq!(cbaser & GITS_CBASER_SIZE_MASK, 1);
        assert_eq!(cbaser & GITS_CBASER_PA_MASK, queue.ring_phys());
        assert_eq!(cbaser & GITS_CBASER_SHAREABILITY_MASK, GITS_CBASER_INNER_SHAREABLE);
        assert!(!queue.needs_flushing());
        assert_eq!(queue.capacity(), 0x2000 / 32);
    }

    #[test]
    fn test_cbaser_non_shareable_fallback() {
        let config = SimItsConfig {
            shareable: false,
            ..Default::default()
        };
        let (memory, its, queue) = setup(config, 0x1000);
        let cbaser = its.cbaser();
        assert_eq!(cbaser & GITS_CBASER_SHAREABILITY_MASK, 0);
        assert_eq!(cbaser & GITS_CBASER_CACHEABILITY_MASK, GITS_CBASER_NC);
        assert!(queue.needs_flushing());

        queue.send_command(&invall(1)).unwrap();
        // Every command block was cleaned before the ITS read it.
        assert!(memory.stale_reads().is_empty());
        assert_eq!(its.commands().len(), 1);
    }

    #[test]
    fn test_invalid_size() {
        let memory: Arc<dyn DmaMemory> = Arc::new(SimMemory::new(true));
        let its = Arc::new(SimIts::new(SimItsConfig::default(), Arc::new(SimMemory::new(true))));
        for size in [0, 0x800, 0x20_1000] {
            assert_eq!(
                CommandQueue::new(
                    its.clone(),
                    &memory,
                    size,
                    Backoff::default(),
                    Arc::new(ItsMetrics::new())
                )
                .unwrap_err(),
                QueueError::InvalidSize(size)
            );
        }
    }

    #[test]
    fn test_sync_follows_command() {
        let (_, its, queue) = setup(SimItsConfig::default(), 0x1000);
        let collection = Collection {
            col_id: 0,
            target_address: 0x5_0000,
        };
        its.resume();
        queue
            .send_command(&ItsCommand::Mapc {
                collection,
                valid: true,
            })
            .unwrap();
        let log = its.commands();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].opcode(), Some(Opcode::Mapc));
        assert_eq!(log[1].opcode(), Some(Opcode::Sync));
        assert_eq!(log[1].target(), 0x5_0000);
        assert_eq!(queue.metrics.commands_sent.count(), 1);
        assert_eq!(queue.metrics.syncs_sent.count(), 1);
    }

    #[test]
    fn test_queue_capacity() {
        let (_, its, queue) = setup(SimItsConfig::default(), 0x1000);
        let capacity = queue.capacity();
        its.pause();

        let mut guard = queue.lock();
        for i in 0..capacity - 1 {
            guard.enqueue(&invall(i as u16)).unwrap();
        }
        // Nothing was posted, so nothing can drain.
        assert_eq!(guard.enqueue(&invall(0)), Err(QueueError::QueueFull));
        assert_eq!(queue.metrics.queue_stalls.count(), 1);
        assert!(queue.is_degraded());

        let token = guard.post();
        drop(guard);
        its.resume();
        queue.wait_for_completion(&token).unwrap();
        assert_eq!(its.commands().len(), capacity as usize - 1);
    }

    #[test]
    fn test_completion_across_wrap() {
        let (_, its, queue) = setup(SimItsConfig::default(), 0x1000);
        let capacity = queue.capacity();
        // Move the ring close to its end.
        for i in 0..capacity - 3 {
            queue.send_command(&invall(i as u16)).unwrap();
        }

        // A batch that wraps around the end of the ring.
        its.set_batch(Some(1));
        let mut guard = queue.lock();
        for i in 0..6 {
            guard.enqueue(&invall(i)).unwrap();
        }
        let token = guard.post();
        drop(guard);
        queue.wait_for_completion(&token).unwrap();
        assert_eq!(its.commands().len(), capacity as usize - 3 + 6);
    }

    #[test]
    fn test_completion_after_ring_wrapped() {
        let (_, its, queue) = setup(SimItsConfig::default(), 0x1000);
        let capacity = queue.capacity();
        let mut guard = queue.lock();
        for i in 0..10 {
            guard.enqueue(&invall(i)).unwrap();
        }
        let token = guard.post();
        drop(guard);

        // Other producers go all the way around the ring before the first poll.
        for i in 0..capacity - 3 {
            queue.send_command(&invall(i as u16)).unwrap();
        }
        assert_eq!(its.commands().len(), capacity as usize + 7);
        queue.wait_for_completion(&token).unwrap();
        assert!(!queue.is_degraded());
        assert_eq!(queue.metrics.completion_timeouts.count(), 0);
    }

    #[test]
    fn test_completion_timeout() {
        let (_, its, queue) = setup(SimItsConfig::default(), 0x1000);
        its.pause();
        let token = queue.lock().send(&invall(0)).unwrap();
        assert_eq!(queue.wait_for_completion(&token), Err(QueueError::Timeout(1)));
        assert_eq!(queue.metrics.completion_timeouts.count(), 1);
        assert!(queue.is_degraded());

        // Progress resumes once the hardware catches up.
        its.resume();
        queue.wait_for_completion(&token).unwrap();
    }
}
