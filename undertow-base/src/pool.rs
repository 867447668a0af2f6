// Fixed-capacity slab pools with typed indices.
//
// Every long-lived record in the coordinator lives in one of these pools and
// is referred to by its stable slot index. Records are cleared when a slot is
// seized, never when it is released: a peer can deliver a late reply naming a
// slot that has since been reused, and the handler discriminates by comparing
// transaction ids, so the stale bytes must already be gone by then.

use std::marker::PhantomData;

/// Typed index into a [`Pool<T>`]. Plain `u32` on the wire; typed in memory
/// so an operation index cannot be confused with a connection index.
pub struct Ix<T> {
    raw: u32,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Ix<T> {
    pub fn new(raw: u32) -> Self {
        Ix {
            raw,
            _ty: PhantomData,
        }
    }
    pub fn raw(self) -> u32 {
        self.raw
    }
}

impl<T> Clone for Ix<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Ix<T> {}
impl<T> PartialEq for Ix<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Ix<T> {}
impl<T> PartialOrd for Ix<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Ix<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}
impl<T> std::hash::Hash for Ix<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}
impl<T> std::fmt::Debug for Ix<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.raw)
    }
}

pub struct Pool<T> {
    slots: Vec<T>,
    live: Vec<bool>,
    free: Vec<u32>,
}

impl<T: Default> Pool<T> {
    /// A pool of `cap` free slots. Seizing yields ascending indices first.
    pub fn new(cap: usize) -> Self {
        assert!(cap < u32::MAX as usize);
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, T::default);
        let live = vec![false; cap];
        let free = (0..cap as u32).rev().collect();
        Pool { slots, live, free }
    }

    /// A pool whose slots are all permanently live, for record arrays that
    /// track their own occupancy in a state field (the connection array walks
    /// every slot on the timer scan, free or not).
    pub fn new_all_live(cap: usize) -> Self {
        let mut pool = Self::new(cap);
        pool.live = vec![true; cap];
        pool.free.clear();
        pool
    }

    pub fn seize(&mut self) -> Option<Ix<T>> {
        let raw = self.free.pop()?;
        self.slots[raw as usize] = T::default();
        self.live[raw as usize] = true;
        Some(Ix::new(raw))
    }

    pub fn release(&mut self, ix: Ix<T>) {
        let i = ix.raw as usize;
        assert!(self.live[i], "release of free slot {:?}", ix);
        self.live[i] = false;
        self.free.push(ix.raw);
    }

    /// Clear a permanently-live slot back to its default. The all-live
    /// record arrays use this in place of seize-time clearing.
    pub fn reset(&mut self, ix: Ix<T>) {
        self.slots[ix.raw as usize] = T::default();
    }

    pub fn get(&self, ix: Ix<T>) -> Option<&T> {
        let i = ix.raw as usize;
        if i < self.slots.len() && self.live[i] {
            Some(&self.slots[i])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, ix: Ix<T>) -> Option<&mut T> {
        let i = ix.raw as usize;
        if i < self.slots.len() && self.live[i] {
            Some(&mut self.slots[i])
        } else {
            None
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.live.iter().filter(|l| **l).count()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (Ix<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| self.live[*i])
            .map(|(i, t)| (Ix::new(i as u32), t))
    }
}
