use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// A cooperative FIFO mutex. `acquire` suspends the caller until every prior
/// acquirer has released; `release` hands the lock to the next waiter in
/// arrival order. An optional waiter bound makes `acquire` fail fast with
/// `LockQueueOverflow` instead of queueing. Not reentrant.
pub struct LockQueue {
    state: Mutex<QueueState>,
    max_waiters: Option<usize>,
}

struct QueueState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl LockQueue {
    pub fn new() -> Self {
        Self::bounded(None)
    }

    pub fn bounded(max_waiters: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            max_waiters,
        }
    }

    /// Acquire the lock, suspending behind earlier acquirers.
    pub async fn acquire(&self) -> Result<()> {
        let rx = {
            let mut state = self.state.lock()?;
            if !state.locked {
                state.locked = true;
                return Ok(());
            }
            if let Some(max) = self.max_waiters {
                if state.waiters.len() >= max {
                    return Err(Error::LockQueueOverflow);
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        rx.await
            .map_err(|_| Error::IO("lock queue dropped while waiting".to_string()))
    }

    /// Release the lock, waking the next live waiter in FIFO order.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("lock queue poisoned");
        loop {
            match state.waiters.pop_front() {
                // Handing the permit over keeps `locked` set for the receiver.
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // Waiter gave up; try the next one.
                    continue;
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub async fn lock(&self) -> Result<QueueGuard<'_>> {
        self.acquire().await?;
        Ok(QueueGuard { queue: self })
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().map(|s| s.waiters.len()).unwrap_or(0)
    }
}

impl Default for LockQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueueGuard<'a> {
    queue: &'a LockQueue,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}
