use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One cancellable timer per key. Rescheduling a key restarts its window.
pub struct Debouncer {
    window: Duration,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `action` once `key` has been quiet for the window.
    pub fn schedule<F>(&self, key: &str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            action.await;
        });
        let mut timers = lock(&self.timers);
        timers.retain(|_, timer| !timer.is_finished());
        if let Some(previous) = timers.insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.timers).remove(key) {
            Some(timer) => {
                let live = !timer.is_finished();
                timer.abort();
                live
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.abort();
        }
    }

    /// Cancels the timers whose key satisfies `matches`; others keep running.
    pub fn cancel_matching<P>(&self, matches: P)
    where
        P: Fn(&str) -> bool,
    {
        lock(&self.timers).retain(|key, timer| {
            if matches(key) {
                timer.abort();
                false
            } else {
                true
            }
        });
    }

    /// Timers that have not fired yet.
    pub fn armed(&self) -> usize {
        lock(&self.timers)
            .values()
            .filter(|timer| !timer.is_finished())
            .count()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Local paths the engine wrote itself, ignored for a bounded window.
pub struct Suppressor {
    window: Duration,
    until: Mutex<HashMap<PathBuf, Instant>>,
}

impl Suppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            until: Mutex::new(HashMap::new()),
        }
    }

    pub fn suppress(&self, path: &Path) {
        let now = Instant::now();
        let mut until = lock(&self.until);
        until.retain(|_, deadline| *deadline > now);
        until.insert(path.to_path_buf(), now + self.window);
    }

    pub fn is_suppressed(&self, path: &Path) -> bool {
        lock(&self.until)
            .get(path)
            .is_some_and(|deadline| *deadline > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn repeated_schedules_fire_once() {
        let debouncer = Debouncer::new(Duration::from_millis(40));
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let fired = Arc::clone(&fired);
            debouncer.schedule("a.txt", async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.armed(), 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let fired = Arc::clone(&fired);
            debouncer.schedule(key, async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        debouncer.schedule("a", async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(debouncer.cancel("a"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!debouncer.cancel("a"));
    }

    #[tokio::test]
    async fn selective_cancel_spares_other_keys() {
        let debouncer = Debouncer::new(Duration::from_millis(20));
        let fired = Arc::new(Mutex::new(Vec::new()));
        for key in ["a.txt", "remote:b.txt"] {
            let fired = Arc::clone(&fired);
            debouncer.schedule(key, async move {
                lock(&fired).push(key);
            });
        }
        debouncer.cancel_matching(|key| !key.starts_with("remote:"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*lock(&fired), vec!["remote:b.txt"]);
    }

    #[test]
    fn suppression_expires() {
        let suppressor = Suppressor::new(Duration::from_millis(20));
        let path = Path::new("/tmp/site/a.txt");
        assert!(!suppressor.is_suppressed(path));
        suppressor.suppress(path);
        assert!(suppressor.is_suppressed(path));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!suppressor.is_suppressed(path));
    }
}
