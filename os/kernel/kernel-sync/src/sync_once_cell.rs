use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;

/// A cell written at most once, then shared read-only.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    slot: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: a single writer publishes with Release before readers observe FULL.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == FULL {
            // SAFETY: FULL is only stored after the slot was written.
            Some(unsafe { (*self.slot.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }

    /// Store `value` if the cell is empty.
    ///
    /// # Errors
    /// Hands `value` back if the cell was already written or is being written.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        // SAFETY: WRITING grants this caller sole access to the slot.
        unsafe { (*self.slot.get()).write(value) };
        self.state.store(FULL, Ordering::Release);
        Ok(())
    }

    /// Initialize on first use and return the stored value.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: WRITING grants this caller sole access to the slot.
            unsafe { (*self.slot.get()).write(init()) };
            self.state.store(FULL, Ordering::Release);
        } else {
            while self.state.load(Ordering::Acquire) != FULL {
                spin_loop();
            }
        }
        // SAFETY: FULL observed (or stored) above.
        unsafe { (*self.slot.get()).assume_init_ref() }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == FULL {
            // SAFETY: FULL means the slot holds a value.
            unsafe { self.slot.get_mut().assume_init_drop() };
        }
    }
}
