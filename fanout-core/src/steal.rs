//! Lock-free claiming of the next unclaimed node in a closed ring.
//!
//! The ring is assumed closed: every node's `next` is non-null at all
//! times, so [`StealCursor::take_next`] never needs a null check in its
//! hot loop, since a worker never needs one.

use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

/// A node that can be linked into an intrusive ring for [`StealCursor`].
pub(crate) trait RingNode: Sized {
    fn next_slot(&self) -> &AtomicPtr<Self>;
}

/// An atomic pointer into a closed ring of [`RingNode`]s.
///
/// At the start of a cycle the cursor is positioned at the first
/// "stealable" node; any thread that runs out of locally assigned work
/// claims the next node by CAS-advancing the cursor to `node.next`.
pub(crate) struct StealCursor<N: RingNode> {
    cursor: CachePadded<AtomicPtr<N>>,
}

impl<N: RingNode> StealCursor<N> {
    pub(crate) fn new(start: *mut N) -> Self {
        StealCursor {
            cursor: CachePadded::new(AtomicPtr::new(start)),
        }
    }

    /// Repositions the cursor for a new cycle.
    pub(crate) fn reset(&self, start: *mut N) {
        self.cursor.store(start, Ordering::Release);
    }

    /// Claims and returns the next node, advancing the cursor past it.
    ///
    /// # Safety
    ///
    /// `start` (as passed to [`StealCursor::new`]/[`StealCursor::reset`])
    /// and every node reachable from it via `next_slot` must remain valid
    /// for the duration of the cycle.
    pub(crate) unsafe fn take_next(&self) -> *mut N {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let next = (*current).next_slot().load(Ordering::Acquire);
            match self.cursor.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use rand::{Rng, SeedableRng};

    struct Node {
        next: AtomicPtr<Node>,
        claimed: AtomicUsize,
    }

    impl RingNode for Node {
        fn next_slot(&self) -> &AtomicPtr<Node> {
            &self.next
        }
    }

    #[test]
    fn take_next_visits_every_node_exactly_once_under_contention() {
        const N: usize = 64;
        let sentinel = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            claimed: AtomicUsize::new(0),
        }));
        let mut nodes: Vec<*mut Node> = Vec::with_capacity(N);
        let mut tail = sentinel;
        for _ in 0..N {
            let node = Box::into_raw(Box::new(Node {
                next: AtomicPtr::new(sentinel),
                claimed: AtomicUsize::new(0),
            }));
            unsafe {
                (*tail).next.store(node, Ordering::Release);
            }
            tail = node;
            nodes.push(node);
        }

        let cursor = Arc::new(StealCursor::new(nodes[0]));
        let total_claims = Arc::new(AtomicUsize::new(0));
        let sentinel_addr = sentinel as usize;
        let handles: Vec<_> = (0..8)
            .map(|thread_seed| {
                let cursor = Arc::clone(&cursor);
                let total_claims = Arc::clone(&total_claims);
                thread::spawn(move || {
                    // Jitter each thread's pace randomly so the CAS race in
                    // `take_next` actually contends instead of running in
                    // lockstep.
                    let mut rng = rand::rngs::StdRng::seed_from_u64(thread_seed as u64 + 1);
                    let sentinel = sentinel_addr as *mut Node;
                    loop {
                        let node = unsafe { cursor.take_next() };
                        if node == sentinel {
                            break;
                        }
                        unsafe {
                            (*node).claimed.fetch_add(1, Ordering::SeqCst);
                        }
                        total_claims.fetch_add(1, Ordering::SeqCst);
                        if rng.gen_bool(0.2) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(total_claims.load(Ordering::SeqCst), N);
        for &node in &nodes {
            unsafe {
                assert_eq!((*node).claimed.load(Ordering::SeqCst), 1);
            }
        }

        for node in nodes {
            unsafe {
                drop(Box::from_raw(node));
            }
        }
        unsafe {
            drop(Box::from_raw(sentinel));
        }
    }
}
