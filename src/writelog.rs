//! Lock-free write ingestion queue
//!
//! Any number of writer threads append mutations with zero coordination
//! between them; a single atomic counter assigns each mutation a globally
//! unique, monotonically increasing sequence number at enqueue time. The
//! reconciler is the sole consumer.
//!
//! Backpressure is advisory: crossing the soft watermark flips the pressure
//! signal for observability, but appends keep succeeding; the queue is
//! bounded only by memory.

use crate::error::{NoemaError, Result};
use crate::types::{Mutation, SequencedMutation, WritePressure};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Multi-producer/single-consumer mutation queue
pub struct WriteLog {
    queue: SegQueue<SequencedMutation>,

    /// Next sequence number to hand out. Sequence numbers start at 1 so 0
    /// can serve as the "nothing applied yet" watermark in snapshots.
    next_sequence: AtomicU64,

    /// Queued-but-undrained mutation count
    pending: AtomicUsize,

    /// Pending count past which the pressure signal flips
    soft_watermark: usize,

    /// Advisory pressure flag; logged once per transition
    degraded: AtomicBool,

    /// Set during shutdown; appends fail afterwards
    shutting_down: AtomicBool,
}

impl WriteLog {
    /// Create an empty write log
    pub fn new(soft_watermark: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            next_sequence: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            soft_watermark,
            degraded: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Enqueue a mutation, returning its assigned sequence number.
    ///
    /// Non-blocking: never waits on the reconciler or on readers. The
    /// mutation is either fully enqueued or (during shutdown) not at all.
    pub fn append(&self, mutation: Mutation) -> Result<u64> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(NoemaError::ShuttingDown);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);

        // Count before pushing: the consumer may drain the record the moment
        // it lands, and the gauge must never read below the queue length
        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        self.queue.push(SequencedMutation { sequence, mutation });

        if pending > self.soft_watermark
            && self
                .degraded
                .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                pending,
                watermark = self.soft_watermark,
                "write log crossed soft watermark, throughput degraded"
            );
        }

        Ok(sequence)
    }

    /// Pop up to `max` mutations, sorted by sequence number.
    ///
    /// Single-consumer: only the reconciler calls this. The batch is sorted
    /// because a producer may be preempted between taking a sequence number
    /// and pushing, so raw pop order is not globally sequence-ordered.
    pub fn drain(&self, max: usize) -> Vec<SequencedMutation> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }

        if !batch.is_empty() {
            let drained = batch.len();
            let pending = self.pending.fetch_sub(drained, Ordering::Relaxed) - drained;
            if pending <= self.soft_watermark
                && self
                    .degraded
                    .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                debug!(pending, "write log pressure back to normal");
            }
            batch.sort_unstable_by_key(|record| record.sequence);
        }

        batch
    }

    /// Queued-but-undrained mutation count
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Advisory pressure signal
    pub fn pressure(&self) -> WritePressure {
        if self.degraded.load(Ordering::Relaxed) {
            WritePressure::Degraded
        } else {
            WritePressure::Normal
        }
    }

    /// Capacity probe for callers that shed load early: `Backpressure` while
    /// the pending volume sits above the soft watermark. Advisory only;
    /// `append` keeps succeeding either way.
    pub fn check_capacity(&self) -> Result<()> {
        if self.degraded.load(Ordering::Relaxed) {
            return Err(NoemaError::Backpressure {
                pending: self.pending(),
            });
        }
        Ok(())
    }

    /// Highest sequence number handed out so far (0 if none)
    pub fn last_assigned_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst) - 1
    }

    /// Fast-forward the counter past sequence numbers recovered from disk so
    /// new mutations never collide with replayed ones
    pub fn advance_past(&self, sequence: u64) {
        self.next_sequence.fetch_max(sequence + 1, Ordering::SeqCst);
    }

    /// Stop accepting appends. Already-queued mutations remain drainable.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}
