use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Cooperative cancellation shared by a session's worker threads.
///
/// Set once at teardown. Sleepers wake immediately when it is set.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Latch>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.set();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_set()
    }

    /// Sleep up to `timeout`. Returns `true` if cancelled, possibly early.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait_timeout(timeout)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A boolean that goes false -> true once, with waiters.
#[derive(Default)]
pub(crate) struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `true` if this call flipped it.
    pub(crate) fn set(&self) -> bool {
        let mut set = self.lock();
        if *set {
            return false;
        }
        *set = true;
        self.cond.notify_all();
        true
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.lock()
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.lock();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = match self.cond.wait_timeout(set, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub(crate) fn wait(&self) {
        let mut set = self.lock();
        while !*set {
            set = match self.cond.wait(set) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn cancel_wakes_sleepers_early() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || sleeper.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn uncancelled_wait_times_out() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn latch_flips_once() {
        let latch = Latch::default();
        assert!(latch.set());
        assert!(!latch.set());
        latch.wait();
        assert!(latch.wait_timeout(Duration::ZERO));
    }
}
