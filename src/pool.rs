//! Fixed-capacity lock-free object pool with intrusive reference counting.
//!
//! [`LockFreePool`] owns a contiguous array of slots. Producers (including
//! threads that must never block) call [`LockFreePool::acquire`] to take a
//! slot, fill it through [`Handle::get_mut`], and pass the [`Handle`] to a
//! background consumer. Cloning a handle adds a reference; the slot goes back
//! to the free list when the last reference is dropped.
//!
//! # Free list
//!
//! The free-list head packs a slot index (low 16 bits) and a generation tag
//! (high 16 bits). Every release stamps a fresh tag, so a reader that loaded
//! the head before a slot was popped and pushed back fails its
//! compare-and-swap instead of installing a stale `next` (the ABA hazard).
//! When the free list is empty, untouched slots are handed out from a bump
//! cursor until the arena is exhausted.
//!
//! # Example
//!
//! ```rust
//! use rs_railnode::pool::LockFreePool;
//!
//! let pool: LockFreePool<u32, 4> = LockFreePool::new();
//!
//! let mut handle = pool.acquire(1).expect("pool has free slots");
//! *handle.get_mut().unwrap() = 42;
//!
//! let shared = handle.clone();
//! assert_eq!(shared.ref_count(), 2);
//! assert_eq!(*shared, 42);
//!
//! drop(handle);
//! drop(shared);
//! assert_eq!(pool.in_use(), 0);
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::{size_of, MaybeUninit};
use core::ops::Deref;
use core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};

const INDEX_MASK: u32 = 0x0000_FFFF;
const TAG_STEP: u32 = 0x0001_0000;

/// Index value marking the end of the free list.
pub const TERMINATOR: u32 = INDEX_MASK;

/// Largest supported pool capacity (the terminator index is reserved).
pub const MAX_CAPACITY: usize = TERMINATOR as usize;

struct Slot<T> {
    /// Free-list key (index + tag) of the next free slot.
    next: AtomicU32,
    /// Live handles. The slot is released when this reaches zero.
    ref_count: AtomicU32,
    /// References handed out by `acquire` but not yet claimed as handles.
    /// Discarded with the slot if no live handle claims them.
    reserved: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            next: AtomicU32::new(TERMINATOR),
            ref_count: AtomicU32::new(0),
            reserved: AtomicU32::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Lock-free pool of `N` slots holding values of type `T`.
///
/// Never blocks and never grows. All operations are plain atomic
/// loads, stores and compare-and-swap loops, so they may be called from
/// any thread, including high-priority producers.
///
/// The pool can live in a `static`, which is how handles are passed to
/// long-lived worker threads:
///
/// ```rust
/// use rs_railnode::pool::LockFreePool;
/// use rs_railnode::packet::PacketBuffer;
///
/// static PACKETS: LockFreePool<PacketBuffer, 8> = LockFreePool::new();
///
/// let packet = PACKETS.acquire(1).unwrap();
/// std::thread::spawn(move || assert!(packet.is_empty())).join().unwrap();
/// assert_eq!(PACKETS.in_use(), 0);
/// ```
pub struct LockFreePool<T, const N: usize> {
    head: AtomicU32,
    tag: AtomicU32,
    cursor: AtomicUsize,
    in_use: AtomicUsize,
    slots: [Slot<T>; N],
}

// Values are created on one thread and dropped on whichever thread releases
// the last handle; handles hand out `&T` to several threads at once.
unsafe impl<T: Send, const N: usize> Send for LockFreePool<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for LockFreePool<T, N> {}

impl<T, const N: usize> LockFreePool<T, N> {
    const CAPACITY_CHECK: () = assert!(
        N > 0 && N <= MAX_CAPACITY,
        "pool capacity must be between 1 and 65535"
    );

    /// Creates an empty pool. Usable in `static` initializers.
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        Self {
            head: AtomicU32::new(TERMINATOR),
            tag: AtomicU32::new(0),
            cursor: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            slots: [const { Slot::new() }; N],
        }
    }

    /// Total number of slots.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of slots currently held by at least one reference.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Takes a slot and moves `value` into it.
    ///
    /// `initial_refs` is the starting reference count (values below 1 are
    /// treated as 1). The returned handle owns one reference; the remaining
    /// `initial_refs - 1` are reserved and can be turned into handles with
    /// [`Handle::claim_reserved`] or given back with [`Handle::drop_reserved`].
    ///
    /// Returns the value back when the pool is exhausted.
    pub fn acquire_with(&self, value: T, initial_refs: u32) -> Result<Handle<'_, T, N>, T> {
        let Some(index) = self.pop_free().or_else(|| self.bump()) else {
            return Err(value);
        };
        debug_assert!(index < N);

        let refs = initial_refs.max(1);
        let slot = &self.slots[index];
        // The slot is off the free list and its count is zero: nobody else
        // can observe it until the handle below exists.
        unsafe { (*slot.value.get()).write(value) };
        slot.reserved.store(refs - 1, Ordering::Relaxed);
        slot.ref_count.store(1, Ordering::Release);
        self.in_use.fetch_add(1, Ordering::Relaxed);

        Ok(Handle { pool: self, index })
    }

    /// Takes a slot holding `T::default()`.
    ///
    /// Returns `None` when every slot is in use. The caller is expected to
    /// drop whatever it wanted to send; exhaustion is not a fault.
    pub fn acquire(&self, initial_refs: u32) -> Option<Handle<'_, T, N>>
    where
        T: Default,
    {
        self.acquire_with(T::default(), initial_refs).ok()
    }

    fn pop_free(&self) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = head & INDEX_MASK;
            if index == TERMINATOR {
                return None;
            }
            let next = self.slots[index as usize].next.load(Ordering::Acquire);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(index as usize),
                Err(actual) => head = actual,
            }
        }
    }

    fn bump(&self) -> Option<usize> {
        let mut cursor = self.cursor.load(Ordering::Relaxed);
        while cursor < N {
            match self.cursor.compare_exchange_weak(
                cursor,
                cursor + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(cursor),
                Err(actual) => cursor = actual,
            }
        }
        None
    }

    /// Drops the slot value and pushes the slot onto the free list.
    fn release(&self, index: usize) {
        let slot = &self.slots[index];
        unsafe { (*slot.value.get()).assume_init_drop() };

        let tag = self.tag.fetch_add(TAG_STEP, Ordering::Relaxed) & !INDEX_MASK;
        let key = index as u32 | tag;

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            slot.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, key, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn head_key(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }
}

impl<T, const N: usize> Default for LockFreePool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for LockFreePool<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreePool")
            .field("capacity", &N)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Shared reference to one pool slot.
///
/// Stores the pool reference and slot index; cloning increments the slot's
/// reference count and dropping decrements it, releasing the slot at zero.
pub struct Handle<'a, T, const N: usize> {
    pool: &'a LockFreePool<T, N>,
    index: usize,
}

impl<'a, T, const N: usize> Handle<'a, T, N> {
    #[inline]
    fn slot(&self) -> &'a Slot<T> {
        &self.pool.slots[self.index]
    }

    /// Slot index inside the pool arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current reference count, including unclaimed reserved references.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        let slot = self.slot();
        slot.ref_count.load(Ordering::Acquire) + slot.reserved.load(Ordering::Acquire)
    }

    /// Payload size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        size_of::<T>()
    }

    /// Raw pointer to the payload, for serializers that work on bytes.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.slot().value.get() as *const T
    }

    /// Mutable access while this is the only reference to the slot,
    /// reserved ones included.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.ref_count() == 1 {
            Some(unsafe { (*self.slot().value.get()).assume_init_mut() })
        } else {
            None
        }
    }

    /// Turns one reserved reference into a handle.
    ///
    /// Returns `None` once all references reserved by `acquire` are claimed.
    pub fn claim_reserved(&self) -> Option<Self> {
        self.slot()
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .ok()
            .map(|_| self.clone())
    }

    /// Gives back every unclaimed reserved reference. Returns how many.
    ///
    /// Optional: reservations left unclaimed when the last handle drops are
    /// discarded with the slot.
    pub fn drop_reserved(&self) -> u32 {
        self.slot().reserved.swap(0, Ordering::AcqRel)
    }
}

impl<T, const N: usize> Clone for Handle<'_, T, N> {
    fn clone(&self) -> Self {
        self.slot().ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            pool: self.pool,
            index: self.index,
        }
    }
}

impl<T, const N: usize> Drop for Handle<'_, T, N> {
    fn drop(&mut self) {
        if self.slot().ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        // No live handle is left to claim what is still reserved.
        self.slot().reserved.store(0, Ordering::Relaxed);
        self.pool.release(self.index);
    }
}

impl<T, const N: usize> Deref for Handle<'_, T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { (*self.slot().value.get()).assume_init_ref() }
    }
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for Handle<'_, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("ref_count", &self.ref_count())
            .field("value", &**self)
            .finish()
    }
}
