use std::collections::VecDeque;

use parking_lot::Mutex;

use tickwire_proto::FrameBody;

use crate::event::ClientId;
use crate::stats::CommsStats;

/// One received frame waiting for the next tick.
#[derive(Debug)]
pub struct Queued {
    pub client: ClientId,
    pub frame: FrameBody,
}

/// FIFO bridge between the I/O threads and the tick thread.
///
/// Producers append under the lock and return immediately. The consumer
/// swaps the whole queue out under the lock and processes the batch
/// without holding it, so a slow consumer never stalls a reader thread.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Queued>>,
}

impl MessageQueue {
    pub fn push(&self, item: Queued) {
        self.inner.lock().push_back(item);
    }

    /// Swap the queue contents out, leaving it empty.
    pub fn drain(&self) -> VecDeque<Queued> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Return undispatched messages to the front, preserving their order
    /// ahead of anything enqueued meanwhile.
    pub fn requeue_front(&self, batch: impl DoubleEndedIterator<Item = Queued>) {
        let mut inner = self.inner.lock();
        for item in batch.rev() {
            inner.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Apply the drain policy to a freshly swapped batch and return the
/// messages to dispatch this tick.
///
/// Drop-accumulated keeps only the newest message of the batch, counting
/// the rest as dropped; otherwise a non-negative per-tick cap dispatches
/// from the front and pushes the remainder back for the next tick.
pub(crate) fn apply_policy(
    queue: &MessageQueue,
    stats: &CommsStats,
    drop_accumulated: bool,
    max_per_tick: i32,
    mut batch: VecDeque<Queued>,
) -> VecDeque<Queued> {
    if drop_accumulated {
        while batch.len() > 1 {
            batch.pop_front();
            stats.record_dropped_message();
        }
    } else if max_per_tick >= 0 && batch.len() > max_per_tick as usize {
        let rest = batch.split_off(max_per_tick as usize);
        queue.requeue_front(rest.into_iter());
    }
    batch
}
