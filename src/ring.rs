// =============================================================================
// SPSC Ring — lock-free single-producer / single-consumer queue
// =============================================================================
//
// The tick hot path between the feed handler (producer) and the 1s aggregator
// (consumer). Head and tail live on separate cache lines to avoid false
// sharing; capacity is rounded up to a power of two so the index mask is a
// single AND.
//
// Overflow never blocks: `push` hands the rejected item back to the caller,
// who counts the drop.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

struct Inner<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot the consumer will read. Written only by the consumer.
    head: CachePadded<AtomicUsize>,
    /// Next slot the producer will write. Written only by the producer.
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: the producer/consumer split guarantees each slot is accessed by at
// most one side at a time, mediated by the head/tail acquire/release pairs.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Drain any items still in flight so their destructors run.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for i in head..tail {
            let slot = &self.buf[i & self.mask];
            unsafe { (*slot.get()).assume_init_drop() };
        }
    }
}

/// Producer half. Exactly one task may hold and use this.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer half. Exactly one task may hold and use this.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Create a ring with at least `capacity` slots (rounded up to a power of
/// two, minimum 2).
pub fn spsc<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let cap = capacity.max(2).next_power_of_two();
    let buf: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..cap)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let inner = Arc::new(Inner {
        buf,
        mask: cap - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Enqueue `value`, or hand it back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) > inner.mask {
            return Err(value);
        }

        let slot = &inner.buf[tail & inner.mask];
        // SAFETY: slot is outside the consumer's visible range until the
        // tail store below publishes it.
        unsafe { (*slot.get()).write(value) };
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }
}

impl<T> Consumer<T> {
    /// Dequeue the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let slot = &inner.buf[head & inner.mask];
        // SAFETY: the tail acquire above guarantees the producer's write to
        // this slot is visible, and the producer cannot reuse it until the
        // head store publishes the consumption.
        let value = unsafe { (*slot.get()).assume_init_read() };
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Acquire);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let (tx, rx) = spsc::<u64>(8);
        for i in 0..5 {
            tx.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn full_ring_rejects_without_blocking() {
        let (tx, rx) = spsc::<u32>(4);
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(99), Err(99));
        assert_eq!(tx.len(), 4);

        // One pop frees one slot.
        assert_eq!(rx.pop(), Some(0));
        tx.push(99).unwrap();
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let (tx, _rx) = spsc::<u8>(5);
        assert_eq!(tx.capacity(), 8);
    }

    #[test]
    fn wraps_around_many_times() {
        let (tx, rx) = spsc::<usize>(4);
        for round in 0..1000 {
            tx.push(round).unwrap();
            assert_eq!(rx.pop(), Some(round));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn cross_thread_transfer() {
        let (tx, rx) = spsc::<u64>(1024);
        let producer = std::thread::spawn(move || {
            let mut pushed = 0u64;
            for i in 0..100_000u64 {
                // Spin until there is room; the test wants every item over.
                let mut v = i;
                loop {
                    match tx.push(v) {
                        Ok(()) => break,
                        Err(back) => v = back,
                    }
                    std::hint::spin_loop();
                }
                pushed += 1;
            }
            pushed
        });

        let mut expected = 0u64;
        while expected < 100_000 {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        assert_eq!(producer.join().unwrap(), 100_000);
    }

    #[test]
    fn drops_in_flight_items() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let (tx, _rx) = spsc::<Tracked>(8);
            for _ in 0..3 {
                let _ = tx.push(Tracked);
            }
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }
}
