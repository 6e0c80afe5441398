//! Disposer handles returned by every subscription in the crate.
//!
//! Calling `dispose()` removes exactly that registration; duplicate disposal
//! is a no-op. Dropping a live disposer also disposes, so subscription
//! lifetime can be tied to whatever struct holds the handle.

use std::sync::Mutex;

type DisposeFn = Box<dyn FnOnce() + Send>;

/// Handle to an active registration (bus listener, store subscription,
/// open-state watcher).
pub struct Disposer {
    inner: Mutex<Option<DisposeFn>>,
}

impl Disposer {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Self { inner: Mutex::new(Some(Box::new(f))) }
    }

    /// Handle that does nothing when disposed.
    pub fn noop() -> Self {
        Self { inner: Mutex::new(None) }
    }

    /// Remove the registration. Safe to call more than once.
    pub fn dispose(&self) {
        if let Some(f) = self.inner.lock().expect("lock").take() {
            f();
        }
    }

    /// Whether the registration is still live.
    pub fn is_live(&self) -> bool {
        self.inner.lock().expect("lock").is_some()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer").field("live", &self.is_live()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_duplicate_dispose_is_noop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let d = Disposer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(d.is_live());
        d.dispose();
        d.dispose();
        d.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!d.is_live());
    }

    #[test]
    fn test_drop_disposes() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        {
            let _d = Disposer::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposed_then_dropped_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        {
            let d = Disposer::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            d.dispose();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
