//! Useful objects and functions.

use std::cell::UnsafeCell;
use std::mem;
use std::ops::{BitAnd, BitOrAssign, BitAndAssign, Deref, DerefMut, Not, Shl};
use std::sync::atomic::{AtomicBool, Ordering};



/// Unsigned integers usable as bit field storage.
pub trait Bits: Copy + Eq + From<u8> + BitOrAssign + BitAndAssign + BitAnd<Output = Self>
    + Not<Output = Self> + Shl<u8, Output = Self> {
    fn ones(self) -> u32;
}

impl Bits for u32 {
    fn ones(self) -> u32 {
        self.count_ones()
    }
}

impl Bits for u64 {
    fn ones(self) -> u32 {
        self.count_ones()
    }
}



/// A bit field based on an unsigned type with a width of 64 at most.
#[derive(Copy, Clone, Debug)]
pub struct BitField<T> {
    bits: T,
    width: u8,
}

impl<T: Bits> BitField<T> {
    /// Constructs a new bit field with the specified width.
    ///
    /// # Panics
    ///
    /// This will panic if the width does not fit within the underlying type.
    pub fn new(width: u8) -> Self {
        assert!((mem::size_of::<T>() * 8) >= width as usize);
        BitField {
            bits: 0u8.into(),
            width: width,
        }
    }

    /// Attempts to set the bit and returns true if successful, i.e. if the bit was not already set.
    ///
    /// # Panics
    ///
    /// This will panic if the addressed bit is not within the field width.
    pub fn try_set(&mut self, bit: u8) -> bool {
        let old = self.bits;
        self.bits |= self.mask(bit);
        old != self.bits
    }

    /// Clears the bit and returns true if it was set.
    pub fn try_clear(&mut self, bit: u8) -> bool {
        let was_set = self.test(bit);
        self.bits &= !self.mask(bit);
        was_set
    }

    pub fn test(&self, bit: u8) -> bool {
        (self.bits & self.mask(bit)) != 0u8.into()
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.bits.ones()
    }

    pub fn clear_all(&mut self) {
        self.bits = 0u8.into();
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    fn mask(&self, bit: u8) -> T {
        assert!(bit < self.width);
        Into::<T>::into(1u8) << bit
    }
}

pub type BitField32 = BitField<u32>;

pub type BitField64 = BitField<u64>;



/// A single-bit token shared between two actors.
///
/// `raise` publishes everything written before it; `take` makes all of it visible to the
/// consumer. Neither ever waits.
#[repr(C)]
#[derive(Debug, Default)]
pub struct AtomicFlag {
    flag: AtomicBool,
}

impl AtomicFlag {
    pub const fn new() -> AtomicFlag {
        AtomicFlag { flag: AtomicBool::new(false) }
    }

    /// Sets the flag with release semantics.
    #[inline]
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Clears the flag and returns whether it was set, with acquire semantics.
    #[inline]
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Reads the flag without consuming it.
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Forces the flag low, used on session reset.
    #[inline]
    pub fn lower(&self) {
        self.flag.store(false, Ordering::Release);
    }
}



/// A spin lock for short critical sections shared between real-time loops.
///
/// The guarded section must be O(1) and may never block; the lock is only meant to make a
/// multi-field update appear atomic to the other side.
#[repr(C)]
pub struct SpinLock<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<T> {
        while self.flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_counts_set_bits() {
        let mut field = BitField64::new(40);
        assert!(field.try_set(3));
        assert!(!field.try_set(3));
        assert!(field.try_set(39));
        assert_eq!(field.count(), 2);
        assert!(field.try_clear(3));
        assert!(!field.try_clear(3));
        assert!(!field.test(3));
        assert_eq!(field.count(), 1);
    }

    #[test]
    #[should_panic]
    fn bitfield_rejects_out_of_range_bit() {
        let mut field = BitField32::new(10);
        field.try_set(10);
    }

    #[test]
    fn flag_is_consumed_once() {
        let flag = AtomicFlag::new();
        assert!(!flag.take());
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn guard_provides_mut_access() {
        let lock = SpinLock::new((1u32, 2u32));
        {
            let mut guard = lock.lock();
            guard.0 += 1;
            guard.1 = 7;
        }
        assert_eq!(*lock.lock(), (2, 7));
    }
}
