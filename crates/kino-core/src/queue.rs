// crates/kino-core/src/queue.rs
//
// Bounded FIFO between pipeline stages. Non-blocking by design: a full push
// hands the element back, an empty pop returns None, and the cooperative
// back-off sleeps live at the call sites. `clear` advances the queue's
// serial, which is what lets consumers recognize pre-seek leftovers.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    serial: i32,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                serial: 0,
            }),
            capacity,
        }
    }

    /// Append `item`, or hand it back when the queue is at capacity.
    pub fn push_tail(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.items.len() >= self.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        Ok(())
    }

    pub fn pop_head(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Inspect the element at `index` without removing it.
    pub fn peek<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().items.get(index).map(f)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn serial(&self) -> i32 {
        self.inner.lock().serial
    }

    /// Drop every element and advance the generation. Returns the number of
    /// elements released.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        inner.serial += 1;
        dropped
    }

    /// Drop every element without touching the generation. Teardown only.
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let q = BoundedQueue::new(4);
        q.push_tail(1).unwrap();
        q.push_tail(2).unwrap();
        q.push_tail(3).unwrap();
        assert_eq!(q.pop_head(), Some(1));
        assert_eq!(q.pop_head(), Some(2));
        assert_eq!(q.pop_head(), Some(3));
        assert_eq!(q.pop_head(), None);
    }

    #[test]
    fn full_push_returns_the_item() {
        let q = BoundedQueue::new(2);
        q.push_tail("a").unwrap();
        q.push_tail("b").unwrap();
        assert_eq!(q.push_tail("c"), Err("c"));
        assert_eq!(q.len(), 2);
        q.pop_head();
        assert!(q.push_tail("c").is_ok());
    }

    #[test]
    fn peek_does_not_remove() {
        let q = BoundedQueue::new(4);
        q.push_tail(7).unwrap();
        q.push_tail(8).unwrap();
        assert_eq!(q.peek(0, |v| *v), Some(7));
        assert_eq!(q.peek(1, |v| *v), Some(8));
        assert_eq!(q.peek(2, |v| *v), None);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn clear_bumps_serial_and_empties() {
        let q = BoundedQueue::new(4);
        q.push_tail(1).unwrap();
        q.push_tail(2).unwrap();
        assert_eq!(q.serial(), 0);
        assert_eq!(q.clear(), 2);
        assert_eq!(q.serial(), 1);
        assert!(q.is_empty());
        q.clear();
        assert_eq!(q.serial(), 2);
    }

    #[test]
    fn drain_keeps_serial() {
        let q = BoundedQueue::new(4);
        q.push_tail(1).unwrap();
        q.clear();
        q.push_tail(2).unwrap();
        assert_eq!(q.drain(), 1);
        assert_eq!(q.serial(), 1);
    }

    // A producer blocked on a full queue resumes after pops and no element
    // is lost or reordered.
    #[test]
    fn producer_backoff_loses_nothing() {
        let q = Arc::new(BoundedQueue::new(2));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..100 {
                    let mut item = i;
                    loop {
                        match q.push_tail(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::sleep(Duration::from_micros(200));
                            }
                        }
                    }
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 100 {
            match q.pop_head() {
                Some(v) => seen.push(v),
                None => thread::sleep(Duration::from_micros(100)),
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
