//! Mutex-guarded shared values.
//!
//! `Synchronized<T>` is the only construct used to guard shared flags,
//! counters and queues. Every mutation goes through the lock and wakes any
//! thread waiting for the value to change, so admission control and queue
//! pops can block with a timeout instead of spinning.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A value whose every access is serialized by a mutex.
#[derive(Debug, Default)]
pub struct Synchronized<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T> Synchronized<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    // Work run under this lock (`Direct`) goes through `TaskEnvelope::run`,
    // which catches the unwind, so a poisoned mutex still guards a
    // consistent value.
    fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        *self.lock() = value;
        self.changed.notify_all();
    }

    /// Modify the value in place and return whatever the closure returns.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.changed.notify_all();
        result
    }

    /// Read the value without modifying it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    /// Wait up to `timeout` for `ready` to hold, then apply `f` under the
    /// same lock acquisition.
    ///
    /// Returns `None` if the timeout elapsed first. A timeout too large to
    /// represent as a deadline waits without one.
    pub fn wait_for<R>(
        &self,
        timeout: Duration,
        mut ready: impl FnMut(&T) -> bool,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock();

        while !ready(&guard) {
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        let result = f(&mut guard);
        drop(guard);
        self.changed.notify_all();
        Some(result)
    }
}

impl<T: Clone> Synchronized<T> {
    /// Return a copy of the value.
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

/// The shared "alive" flag polled by accept loops, schedulers and handlers.
///
/// Owned by a server instance; clones share the same flag.
#[derive(Debug, Clone)]
pub struct AliveFlag(Arc<Synchronized<bool>>);

impl AliveFlag {
    /// A new flag in the alive state.
    pub fn new() -> Self {
        Self(Arc::new(Synchronized::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.get()
    }

    /// Clear the flag. Idempotent.
    pub fn kill(&self) {
        self.0.set(false);
    }

    /// Block until the flag clears or `timeout` elapses.
    ///
    /// Returns `true` if the flag is cleared.
    pub fn wait_killed(&self, timeout: Duration) -> bool {
        self.0.wait_for(timeout, |alive| !*alive, |_| ()).is_some()
    }
}

impl Default for AliveFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_get_modify() {
        let value = Synchronized::new(1u32);
        value.set(5);
        assert_eq!(value.get(), 5);

        let previous = value.modify(|v| {
            let old = *v;
            *v += 10;
            old
        });
        assert_eq!(previous, 5);
        assert_eq!(value.read(|v| *v), 15);
    }

    #[test]
    fn test_concurrent_modify_is_serialized() {
        let counter = Arc::new(Synchronized::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.modify(|c| *c += 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_wait_for_times_out() {
        let value = Synchronized::new(0u8);
        let result = value.wait_for(Duration::from_millis(20), |v| *v > 0, |v| *v);
        assert!(result.is_none());
    }

    #[test]
    fn test_wait_for_wakes_on_change() {
        let value = Arc::new(Synchronized::new(Vec::<u32>::new()));
        let producer = {
            let value = Arc::clone(&value);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                value.modify(|v| v.push(7));
            })
        };

        let popped = value.wait_for(Duration::from_secs(5), |v| !v.is_empty(), |v| v.pop());
        producer.join().unwrap();
        assert_eq!(popped, Some(Some(7)));
    }

    #[test]
    fn test_wait_for_unbounded_timeout() {
        let value = Arc::new(Synchronized::new(false));
        let setter = {
            let value = Arc::clone(&value);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                value.set(true);
            })
        };

        let seen = value.wait_for(Duration::MAX, |ready| *ready, |ready| *ready);
        setter.join().unwrap();
        assert_eq!(seen, Some(true));

        // Already ready: returns without waiting at all.
        assert_eq!(value.wait_for(Duration::MAX, |ready| *ready, |_| 1), Some(1));
    }

    #[test]
    fn test_alive_flag() {
        let alive = AliveFlag::new();
        let observer = alive.clone();
        assert!(observer.is_alive());
        assert!(!observer.wait_killed(Duration::from_millis(10)));

        alive.kill();
        assert!(!observer.is_alive());
        assert!(observer.wait_killed(Duration::from_millis(10)));
    }
}
