use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// Multi-producer multi-consumer FIFO with a non-blocking producer side.
///
/// Backs both the token bucket and the pending-call queue. The token bucket
/// only cares about counting, the pending queue about ordering; the FIFO
/// property serves the latter and is incidental for the former.
pub(crate) struct ConcurrentFifo<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> ConcurrentFifo<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().expect("fifo lock poisoned")
    }

    /// Append an item; never blocks.
    pub(crate) fn offer(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Pop the head, or `None` when empty; never blocks.
    pub(crate) fn try_take(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pop the head, waiting for an item when empty.
    pub(crate) async fn take(&self) -> T {
        loop {
            // Register for a wakeup before checking so an offer between the
            // check and the await is not lost.
            let notified = self.available.notified();
            if let Some(item) = self.try_take() {
                return item;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
