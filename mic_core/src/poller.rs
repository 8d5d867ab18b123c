//! C9: periodic reconciliation against external OS state (default-device
//! drift that notifications missed, mix-format changes on an endpoint
//! already open for metering).
//!
//! Per an Open Question resolution recorded in `DESIGN.md`: a background
//! tick thread is only started when the Coordinator is constructed with a
//! real [`crate::scheduling::SchedulingContext`]. In headless/test
//! construction (no scheduler), nothing runs on a timer; tests instead call
//! [`ExternalStatePoller::poll_once`] to drive one reconciliation pass
//! deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct ExternalStatePoller {
    period: Duration,
    stop: Arc<AtomicBool>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ExternalStatePoller {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            stop: Arc::new(AtomicBool::new(false)),
            thread: parking_lot::Mutex::new(None),
        }
    }

    /// Start a background thread invoking `tick` every `period` until
    /// [`ExternalStatePoller::stop`] is called or the poller is dropped.
    /// Only meaningful to call once; a second call is a no-op.
    pub fn start_background<F>(&self, tick: F)
    where
        F: Fn() + Send + 'static,
    {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        let stop = self.stop.clone();
        let period = self.period;
        *guard = Some(
            std::thread::Builder::new()
                .name("mic-state-poller".into())
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(period);
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        tick();
                    }
                })
                .expect("failed to spawn state-poller thread"),
        );
    }

    /// Run one reconciliation pass synchronously on the calling thread.
    /// Used by tests and by any caller with no background scheduler.
    pub fn poll_once<F: FnOnce()>(&self, tick: F) {
        tick();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ExternalStatePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn poll_once_runs_synchronously_exactly_once() {
        let poller = ExternalStatePoller::new(Duration::from_secs(60));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        poller.poll_once(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn background_ticks_repeat_until_stopped() {
        let poller = ExternalStatePoller::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        poller.start_background(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(55));
        poller.stop();
        assert!(count.load(Ordering::SeqCst) >= 3, "count={}", count.load(Ordering::SeqCst));
    }

    #[test]
    fn starting_background_twice_is_a_no_op() {
        let poller = ExternalStatePoller::new(Duration::from_millis(10));
        poller.start_background(|| {});
        poller.start_background(|| {});
        poller.stop();
    }
}
