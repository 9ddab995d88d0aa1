//! Priority queue with a sorted-list fallback.
//!
//! A binary min-heap ordered by a caller-supplied comparator. Each element
//! is a stable handle; the queue tracks its 1-based heap position so that
//! [`PQueue::update`] and [`PQueue::remove`] run in O(log n) (position 0 is
//! the not-in-queue sentinel, kept as absence from the position map). When
//! growing the heap's backing array fails, the queue transparently degrades
//! to a sorted list with the same interface and comparator; operations on
//! the list variant are linear but still correct.
//!
//! The donation forest uses this queue for its ordered donor sets, keyed by
//! donated priority with a greater-than comparator (so `top` is the
//! highest-priority donor).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::KernelError;

/// Comparator: `true` if the first key sorts before the second.
pub type LessFn<K> = fn(&K, &K) -> bool;

enum Repr<K, T> {
    /// 0-based array storage; positions reported 1-based through `pos`.
    Heap(Vec<(K, T)>),
    /// Kept sorted ascending by the comparator. Degraded mode after a
    /// failed heap growth.
    List(Vec<(K, T)>),
}

/// A min-heap by `less` over `(key, item)` pairs, with stable item handles.
pub struct PQueue<K, T> {
    repr: Repr<K, T>,
    /// 1-based heap position per item. Only maintained in heap mode.
    pos: BTreeMap<T, usize>,
    less: LessFn<K>,
}

impl<K: Copy, T: Copy + Ord> PQueue<K, T> {
    /// Creates an empty queue ordered by `less`.
    pub fn new(less: LessFn<K>) -> Self {
        PQueue {
            repr: Repr::Heap(Vec::new()),
            pos: BTreeMap::new(),
            less,
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Heap(data) | Repr::List(data) => data.len(),
        }
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `item` is currently queued.
    pub fn contains(&self, item: T) -> bool {
        match &self.repr {
            Repr::Heap(_) => self.pos.contains_key(&item),
            Repr::List(data) => data.iter().any(|&(_, t)| t == item),
        }
    }

    /// The minimum item by the comparator, with its key.
    pub fn top(&self) -> Option<(K, T)> {
        match &self.repr {
            Repr::Heap(data) | Repr::List(data) => data.first().copied(),
        }
    }

    /// Queues `item` under `key`. The item must not already be queued.
    ///
    /// On heap-growth failure the queue switches to list mode; the push is
    /// retried there and only fails if even a single-element reservation is
    /// refused.
    pub fn push(&mut self, item: T, key: K) -> Result<(), KernelError> {
        assert!(!self.contains(item), "pqueue: item already queued");

        if let Repr::Heap(data) = &mut self.repr {
            if data.len() == data.capacity() {
                let grow = data.len().max(4);
                if data.try_reserve(grow).is_err() {
                    self.degrade_to_list();
                } else {
                    data.push((key, item));
                    let idx = data.len() - 1;
                    self.pos.insert(item, idx + 1);
                    self.sift_up(idx);
                    return Ok(());
                }
            } else {
                data.push((key, item));
                let idx = data.len() - 1;
                self.pos.insert(item, idx + 1);
                self.sift_up(idx);
                return Ok(());
            }
        }

        let less = self.less;
        let Repr::List(data) = &mut self.repr else {
            unreachable!();
        };
        if data.len() == data.capacity() && data.try_reserve(1).is_err() {
            return Err(KernelError::OutOfMemory {
                what: "priority queue growth",
            });
        }
        let at = data.partition_point(|(k, _)| less(k, &key));
        data.insert(at, (key, item));
        Ok(())
    }

    /// Removes and returns the minimum item.
    pub fn pop(&mut self) -> Option<T> {
        match &mut self.repr {
            Repr::Heap(data) => {
                let (_, out) = *data.first()?;
                self.pos.remove(&out);
                let last = data.pop().expect("non-empty");
                if let Some(slot) = data.first_mut() {
                    *slot = last;
                    self.pos.insert(last.1, 1);
                    self.sift_down(0);
                }
                Some(out)
            }
            Repr::List(data) => {
                if data.is_empty() {
                    None
                } else {
                    Some(data.remove(0).1)
                }
            }
        }
    }

    /// Re-keys a queued item and restores the ordering invariant.
    pub fn update(&mut self, item: T, key: K) {
        match &mut self.repr {
            Repr::Heap(data) => {
                let idx = self.pos.get(&item).expect("pqueue: item not queued") - 1;
                data[idx].0 = key;
                self.sift_up(idx);
                self.sift_down(idx);
            }
            Repr::List(_) => {
                self.remove(item);
                self.push(item, key).expect("list reinsert after remove cannot grow");
            }
        }
    }

    /// Removes a queued item from an arbitrary position.
    pub fn remove(&mut self, item: T) {
        match &mut self.repr {
            Repr::Heap(data) => {
                let idx = self.pos.remove(&item).expect("pqueue: item not queued") - 1;
                let last = data.pop().expect("non-empty");
                if idx == data.len() {
                    return;
                }
                data[idx] = last;
                self.pos.insert(last.1, idx + 1);
                self.sift_up(idx);
                self.sift_down(idx);
            }
            Repr::List(data) => {
                let at = data
                    .iter()
                    .position(|&(_, t)| t == item)
                    .expect("pqueue: item not queued");
                data.remove(at);
            }
        }
    }

    /// Converts heap storage into the sorted-list representation.
    fn degrade_to_list(&mut self) {
        let less = self.less;
        let data = match &mut self.repr {
            Repr::Heap(data) => core::mem::take(data),
            Repr::List(_) => return,
        };
        let mut sorted = data;
        sorted.sort_by(|a, b| {
            if less(&a.0, &b.0) {
                core::cmp::Ordering::Less
            } else if less(&b.0, &a.0) {
                core::cmp::Ordering::Greater
            } else {
                core::cmp::Ordering::Equal
            }
        });
        self.pos.clear();
        self.repr = Repr::List(sorted);
    }

    fn sift_up(&mut self, mut idx: usize) {
        let less = self.less;
        let Repr::Heap(data) = &mut self.repr else {
            return;
        };
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if less(&data[idx].0, &data[parent].0) {
                data.swap(idx, parent);
                self.pos.insert(data[idx].1, idx + 1);
                self.pos.insert(data[parent].1, parent + 1);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let less = self.less;
        let Repr::Heap(data) = &mut self.repr else {
            return;
        };
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < data.len() && less(&data[left].0, &data[smallest].0) {
                smallest = left;
            }
            if right < data.len() && less(&data[right].0, &data[smallest].0) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            data.swap(idx, smallest);
            self.pos.insert(data[idx].1, idx + 1);
            self.pos.insert(data[smallest].1, smallest + 1);
            idx = smallest;
        }
    }
}
