//! Bounded frame queue between the modulator thread and the transmitter
//! worker
//!
//! The producer enqueues with [`FrameQueue::push_overflow`], which drops the
//! oldest element instead of blocking when the bound is reached. The single
//! consumer blocks in [`FrameQueue::wait_and_pop`]; shutdown is signalled
//! with [`FrameQueue::trigger_wakeup`], which the consumer receives as
//! [`Popped::Wakeup`] distinguishable from regular data.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Result of a [`FrameQueue::push_overflow`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushResult {
    /// The oldest element was discarded to make room
    pub overflowed: bool,
    /// Queue length after the push
    pub new_size: usize,
}

/// Result of a [`FrameQueue::wait_and_pop`] call
#[derive(Debug)]
pub enum Popped<T> {
    /// An element was dequeued
    Element(T),
    /// The queue was woken for shutdown
    Wakeup,
}

struct Inner<T> {
    elements: VecDeque<T>,
    wakeup: bool,
}

/// Bounded multi-producer single-consumer queue with drop-oldest overflow
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> FrameQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                elements: VecDeque::new(),
                wakeup: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue `element`, keeping at most `max_size` elements. If the queue
    /// is full the OLDEST element is dropped so the new one always fits.
    pub fn push_overflow(&self, element: T, max_size: usize) -> PushResult {
        let mut inner = self.inner.lock().unwrap();

        let overflowed = inner.elements.len() >= max_size;
        while inner.elements.len() >= max_size {
            inner.elements.pop_front();
        }
        inner.elements.push_back(element);
        let new_size = inner.elements.len();

        self.not_empty.notify_one();
        PushResult {
            overflowed,
            new_size,
        }
    }

    /// Block until an element is available or a wakeup is triggered.
    ///
    /// A pending wakeup takes precedence over queued elements and is
    /// consumed by the call that observes it.
    pub fn wait_and_pop(&self) -> Popped<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.wakeup {
                inner.wakeup = false;
                return Popped::Wakeup;
            }
            if let Some(element) = inner.elements.pop_front() {
                return Popped::Element(element);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Wake a consumer blocked in [`wait_and_pop`](Self::wait_and_pop).
    /// The signal is sticky until one consumer observes it.
    pub fn trigger_wakeup(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.wakeup = true;
        self.not_empty.notify_all();
    }

    /// Current queue length
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_push_pop_order() {
        let q = FrameQueue::new();
        q.push_overflow(1, 8);
        q.push_overflow(2, 8);
        q.push_overflow(3, 8);

        for expected in 1..=3 {
            match q.wait_and_pop() {
                Popped::Element(v) => assert_eq!(v, expected),
                Popped::Wakeup => panic!("unexpected wakeup"),
            }
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let q = FrameQueue::new();
        for i in 0..251u32 {
            let r = q.push_overflow(i, 250);
            if i < 250 {
                assert!(!r.overflowed);
                assert_eq!(r.new_size, i as usize + 1);
            } else {
                assert!(r.overflowed);
                assert_eq!(r.new_size, 250);
            }
        }

        // element 0 was discarded, 1 survives as the oldest
        match q.wait_and_pop() {
            Popped::Element(v) => assert_eq!(v, 1),
            Popped::Wakeup => panic!("unexpected wakeup"),
        }
    }

    #[test]
    fn test_wakeup_unblocks_consumer() {
        let q = Arc::new(FrameQueue::<u32>::new());
        let q2 = Arc::clone(&q);

        let handle = thread::spawn(move || matches!(q2.wait_and_pop(), Popped::Wakeup));

        thread::sleep(Duration::from_millis(50));
        q.trigger_wakeup();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wakeup_takes_precedence() {
        let q = FrameQueue::new();
        q.push_overflow(7, 8);
        q.trigger_wakeup();

        assert!(matches!(q.wait_and_pop(), Popped::Wakeup));
        // after the wakeup is consumed, data is still there
        assert!(matches!(q.wait_and_pop(), Popped::Element(7)));
    }
}
