//! Lock helpers.
//!
//! A summary guards its state with several named locks, always taken in
//! this order:
//!
//! ```text
//! dump -> io -> summary -> hash -> ref
//! ```
//!
//! A panic while a lock is held poisons it. The data behind every summary
//! lock stays structurally valid between statements, so a poisoned lock is
//! logged and recovered instead of propagating the panic to every caller.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Lock a mutex, recovering from poisoning.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e: PoisonError<_>| {
        warn!("Recovering poisoned mutex");
        e.into_inner()
    })
}

/// Take a read lock, recovering from poisoning.
pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| {
        warn!("Recovering poisoned read lock");
        e.into_inner()
    })
}

/// Take a write lock, recovering from poisoning.
pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| {
        warn!("Recovering poisoned write lock");
        e.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_poisoned_mutex_is_recovered() {
        let shared = Arc::new(Mutex::new(5));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison it");
        })
        .join();
        assert!(shared.is_poisoned());
        assert_eq!(*lock(&shared), 5);
    }

    #[test]
    fn test_poisoned_rwlock_is_recovered() {
        let shared = Arc::new(RwLock::new(vec![1]));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.write().unwrap();
            panic!("poison it");
        })
        .join();
        write(&shared).push(2);
        assert_eq!(*read(&shared), vec![1, 2]);
    }
}
