//! Single-slot handoff between a producer and one worker thread.
//!
//! `put` blocks while the slot is occupied, so the producer is throttled to
//! the worker's pace and nothing is dropped. `close` wakes both sides; after
//! it, `put` fails and `take` drains what is left and then returns `None`.

use anyhow::{anyhow, Result};
use std::sync::{Condvar, Mutex, MutexGuard};

struct Slot<T> {
    item: Option<T>,
    closed: bool,
}

pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                item: None,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Store `item`, waiting for the previous one to be taken.
    pub fn put(&self, item: T) -> Result<()> {
        let mut slot = self.lock();
        while slot.item.is_some() && !slot.closed {
            slot = self
                .changed
                .wait(slot)
                .map_err(|_| anyhow!("mailbox lock poisoned"))?;
        }
        if slot.closed {
            return Err(anyhow!("mailbox closed"));
        }
        slot.item = Some(item);
        self.changed.notify_all();
        Ok(())
    }

    /// Wait for an item. `None` once the mailbox is closed and empty.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if let Some(item) = slot.item.take() {
                self.changed.notify_all();
                return Some(item);
            }
            if slot.closed {
                return None;
            }
            slot = self
                .changed
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        self.changed.notify_all();
    }

    /// Close the mailbox when the returned guard goes out of scope, including
    /// when the worker holding it unwinds.
    pub fn close_on_drop(&self) -> CloseGuard<'_, T> {
        CloseGuard { mailbox: self }
    }

    pub fn is_full(&self) -> bool {
        self.lock().item.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct CloseGuard<'a, T> {
    mailbox: &'a Mailbox<T>,
}

impl<T> Drop for CloseGuard<'_, T> {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_put_waits_for_take() -> Result<()> {
        let mailbox = Arc::new(Mailbox::new());
        mailbox.put(1u32)?;
        assert!(mailbox.is_full());

        let second_stored = Arc::new(AtomicBool::new(false));
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            let second_stored = Arc::clone(&second_stored);
            std::thread::spawn(move || {
                let result = mailbox.put(2u32);
                second_stored.store(true, Ordering::SeqCst);
                result
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!second_stored.load(Ordering::SeqCst));

        assert_eq!(mailbox.take(), Some(1));
        producer.join().expect("producer thread")?;
        assert!(second_stored.load(Ordering::SeqCst));
        assert_eq!(mailbox.take(), Some(2));
        Ok(())
    }

    #[test]
    fn close_releases_blocked_producer_and_consumer() -> Result<()> {
        let mailbox = Arc::new(Mailbox::<u32>::new());
        let consumer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || mailbox.take())
        };
        std::thread::sleep(Duration::from_millis(50));
        mailbox.close();
        assert_eq!(consumer.join().expect("consumer thread"), None);
        assert!(mailbox.put(5).is_err());
        Ok(())
    }

    #[test]
    fn dead_worker_releases_producer() -> Result<()> {
        let mailbox = Arc::new(Mailbox::new());
        mailbox.put(1u32)?;
        let worker = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                let _closed = mailbox.close_on_drop();
                let _ = mailbox.take();
                panic!("worker failed");
            })
        };
        assert!(worker.join().is_err());
        assert!(mailbox.put(2).is_err());
        assert!(mailbox.put(3).is_err());
        Ok(())
    }

    #[test]
    fn pending_item_survives_close() -> Result<()> {
        let mailbox = Mailbox::new();
        mailbox.put("frame")?;
        mailbox.close();
        assert_eq!(mailbox.take(), Some("frame"));
        assert_eq!(mailbox.take(), None);
        Ok(())
    }
}
