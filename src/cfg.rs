pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};
}

pub mod cell {
    #[cfg(not(all(loom, test)))]
    pub use core::cell::UnsafeCell;

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::cell::UnsafeCell;

    /// A trait that extends [`UnsafeCell`] to allow running closures against
    /// its underlying data.
    pub trait UnsafeCellWith<T: ?Sized> {
        /// Runs `f` against a shared reference borrowed from a [`UnsafeCell`].
        ///
        /// # Safety
        ///
        /// Caller must guarantee there are no mutable aliases to the
        /// underlying data.
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret;

        /// Runs `f` against a mutable reference borrowed from a [`UnsafeCell`].
        ///
        /// # Safety
        ///
        /// Caller must guarantee there are no other aliases to the underlying
        /// data, for the duration of the call.
        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret;
    }

    #[cfg(not(all(loom, test)))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        #[inline(always)]
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            f(unsafe { &*self.get() })
        }

        #[inline(always)]
        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no other aliases.
            f(unsafe { &mut *self.get() })
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            f(unsafe { self.get().deref() })
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no other aliases.
            f(unsafe { self.get_mut().deref() })
        }
    }
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::hint::spin_loop;
}

#[cfg(any(feature = "std", test))]
pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub use loom::thread::yield_now;
}
