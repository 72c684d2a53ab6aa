use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(20);

/// Shared cooperative stop flag. Clones observe the same flag; once
/// requested it stays requested, so every run needs a fresh token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    requested: Arc<AtomicBool>,
    // Flags of every ancestor, nearest first.
    parents: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled along with `self`, but whose own
    /// cancellation does not reach `self`.
    pub fn child(&self) -> Self {
        let mut parents = Vec::with_capacity(self.parents.len() + 1);
        parents.push(Arc::clone(&self.requested));
        parents.extend(self.parents.iter().cloned());
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            parents,
        }
    }

    pub fn request_cancellation(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
            || self.parents.iter().any(|p| p.load(Ordering::Acquire))
    }

    /// Poll point for monitor loops. Sleeps for `duration` in short slices and
    /// returns `true` as soon as cancellation is observed.
    pub fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancellation_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_idempotent_and_shared_across_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancellation_requested());
        token.request_cancellation();
        token.request_cancellation();
        assert!(observer.is_cancellation_requested());
        assert!(token.is_cancellation_requested());
    }

    #[test]
    fn fresh_token_is_independent() {
        let first = CancellationToken::new();
        first.request_cancellation();
        assert!(!CancellationToken::new().is_cancellation_requested());
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();
        child.request_cancellation();
        assert!(grandchild.is_cancellation_requested());
        assert!(!parent.is_cancellation_requested());

        let sibling = parent.child();
        assert!(!sibling.is_cancellation_requested());
        parent.request_cancellation();
        assert!(sibling.is_cancellation_requested());
        assert!(sibling.child().is_cancellation_requested());
    }

    #[test]
    fn sleep_returns_early_on_cancellation() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.request_cancellation();
        });
        let started = Instant::now();
        assert!(token.sleep_unless_cancelled(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("canceller thread");
    }

    #[test]
    fn sleep_runs_to_completion_without_request() {
        let token = CancellationToken::new();
        assert!(!token.sleep_unless_cancelled(Duration::from_millis(30)));
    }
}
