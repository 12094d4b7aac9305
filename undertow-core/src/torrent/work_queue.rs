//! Shared queue of pieces still to be downloaded

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::PieceWork;

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PieceWork>,
    closed: bool,
}

/// FIFO of pieces that no worker currently owns.
///
/// Popping transfers ownership of a piece to the caller; a failed attempt
/// hands it back with `push`. Capacity equals the piece count, since every
/// piece is in at most one place at a time.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
}

impl WorkQueue {
    /// Creates a queue seeded with `pieces`.
    pub fn new(pieces: Vec<PieceWork>) -> Self {
        let capacity = pieces.len();
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::from(pieces),
                closed: false,
            }),
            available: Notify::new(),
            capacity,
        }
    }

    /// Returns a piece to the back of the queue.
    ///
    /// Pieces pushed after `close` are dropped, since nobody will pop them.
    pub fn push(&self, work: PieceWork) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            debug_assert!(
                state.pending.len() < self.capacity,
                "piece {} queued twice",
                work.index
            );
            state.pending.push_back(work);
        }
        self.available.notify_one();
    }

    /// Waits for the next piece; `None` once the queue is closed.
    pub async fn pop(&self) -> Option<PieceWork> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(work) = state.pending.pop_front() {
                    return Some(work);
                }
            }
            notified.await;
        }
    }

    /// Takes the next piece without waiting.
    pub fn try_pop(&self) -> Option<PieceWork> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.pending.pop_front()
    }

    /// Wakes every waiter with `None`; later pushes are discarded.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Pieces waiting for a worker (not counting those in flight).
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
