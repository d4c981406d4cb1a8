use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::PixelCache;

/// Background thread calling [`PixelCache::flush_aged`] at a fixed interval.
/// Stops when dropped or once the cache is gone.
pub struct AgingTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl AgingTimer {
    pub fn start(cache: &Arc<PixelCache>, interval: Duration) -> Self {
        let cache: Weak<PixelCache> = Arc::downgrade(cache);
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);

        let spawned = std::thread::Builder::new()
            .name("pixelpipe-aging".to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                while !*stopped {
                    let wait = cvar.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    if !wait.timed_out() {
                        continue;
                    }
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    MutexGuard::unlocked(&mut stopped, || {
                        let removed = cache.flush_aged();
                        if removed > 0 {
                            tracing::debug!("[pixelpipe_cache] aging sweep removed {removed} entries");
                        }
                    });
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!("[pixelpipe_cache] failed to start aging thread: {err}");
                None
            }
        };

        Self { stop, handle }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if handle.join().is_err() {
            tracing::warn!("[pixelpipe_cache] aging thread panicked");
        }
    }
}

impl Drop for AgingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
