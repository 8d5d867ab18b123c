//! C1: a dedicated, long-lived apartment thread for the undocumented
//! default-device policy object (§9: "do not fold it into a general thread
//! pool; a single dedicated thread with the correct apartment initialization
//! is the contract").
//!
//! Work is submitted as closures and run FIFO, one at a time, under
//! `catch_unwind` so a panicking call can't take the whole worker down with
//! it. `dispose()` drains whatever is already queued, then joins the thread
//! with a bounded wait.

use crate::error::CoreError;
use anyhow::{Result, anyhow};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wrapper allowing a COM pointer/interface to cross threads safely.
///
/// `windows-rs` COM wrappers are usually `!Send`/`!Sync` because the objects
/// are apartment-affine. `ComSend<T>` is a promise, not a proof: the value
/// may move between threads, but it must only be unwrapped and used on the
/// apartment thread that owns it (unless `T: Send`, in which case
/// [`ComSend::unwrap`] is safe on any thread).
pub struct ComSend<T>(T);

unsafe impl<T> Send for ComSend<T> {}
unsafe impl<T> Sync for ComSend<T> {}

impl<T> ComSend<T> {
    pub fn new(t: T) -> Self {
        Self(t)
    }

    /// Consume the wrapper. Crate-private: callers outside the apartment
    /// thread must never unwrap a non-`Send` COM interface.
    pub(crate) fn take(self) -> T {
        self.0
    }
}

impl<T: Send> ComSend<T> {
    pub fn unwrap(self) -> T {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Apartment {
    /// Single-threaded apartment (STA) -> COINIT_APARTMENTTHREADED. Required
    /// by the policy-config object.
    #[default]
    STA,
    /// Multi-threaded apartment (MTA) -> COINIT_MULTITHREADED.
    MTA,
}

type Job = Box<dyn FnOnce() + Send>;

pub struct ApartmentWorker {
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    disposed: AtomicBool,
    dispose_timeout: Duration,
}

impl ApartmentWorker {
    /// Spawn the apartment thread and block until its COM environment has
    /// initialized (or failed to).
    pub fn new(apartment: Apartment, dispose_timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let handle = thread::Builder::new()
            .name("mic-apartment".into())
            .spawn(move || Self::run(apartment, rx, ready_tx))
            .map_err(|e| anyhow!("failed to spawn apartment thread: {e}"))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => return Err(anyhow!("apartment initialization failed: {msg}")),
            Err(_) => return Err(anyhow!("apartment thread exited before initializing")),
        }

        Ok(Self {
            sender: Some(tx),
            handle: Some(handle),
            disposed: AtomicBool::new(false),
            dispose_timeout,
        })
    }

    fn run(
        apartment: Apartment,
        rx: Receiver<Job>,
        ready_tx: Sender<std::result::Result<(), String>>,
    ) {
        #[cfg(target_os = "windows")]
        let _com_guard = match init_com(apartment) {
            Ok(guard) => {
                let _ = ready_tx.send(Ok(()));
                guard
            }
            Err(e) => {
                let _ = ready_tx.send(Err(format!("{e:?}")));
                return;
            }
        };
        #[cfg(not(target_os = "windows"))]
        {
            let _ = apartment;
            let _ = ready_tx.send(Ok(()));
        }

        for job in rx.iter() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                log::error!("apartment worker job panicked: {}", panic_message(&payload));
            }
        }
    }

    /// Queue a unit of work and block the caller until it completes.
    pub fn call_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let sender = self.live_sender()?;
        let (tx, rx) = mpsc::sync_channel::<Result<R>>(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        sender
            .send(job)
            .map_err(|_| anyhow!(CoreError::Disposed))?;
        rx.recv()
            .map_err(|_| anyhow!("apartment worker job panicked before producing a result"))?
    }

    /// Queue a unit of work; the returned future completes with its result.
    pub fn call_async<R, F>(&self, f: F) -> futures::future::BoxFuture<'static, Result<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel::<Result<R>>();
        let submitted = self.live_sender().and_then(|sender| {
            let job: Job = Box::new(move || {
                let _ = tx.send(f());
            });
            sender.send(job).map_err(|_| anyhow!(CoreError::Disposed))
        });

        Box::pin(async move {
            submitted?;
            rx.await
                .map_err(|_| anyhow!("apartment worker job panicked before producing a result"))?
        })
    }

    fn live_sender(&self) -> Result<&Sender<Job>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(anyhow!(CoreError::Disposed));
        }
        self.sender.as_ref().ok_or_else(|| anyhow!(CoreError::Disposed))
    }

    /// Signal no more work, drain whatever is already queued, and join the
    /// thread with a bounded wait. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender = None; // closes the channel once drained
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let timeout = self.dispose_timeout;
        let waiter = thread::spawn(move || {
            let _ = handle.join();
            let _ = done_tx.send(());
        });
        match done_rx.recv_timeout(timeout) {
            Ok(()) => {
                let _ = waiter.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "apartment worker dispose exceeded {:?}, abandoning the thread",
                    timeout
                );
            }
            Err(RecvTimeoutError::Disconnected) => {}
        }
    }
}

impl Drop for ApartmentWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(target_os = "windows")]
struct ComInitGuard;

#[cfg(target_os = "windows")]
impl Drop for ComInitGuard {
    fn drop(&mut self) {
        unsafe {
            windows::Win32::System::Com::CoUninitialize();
        }
    }
}

#[cfg(target_os = "windows")]
fn init_com(apartment: Apartment) -> Result<ComInitGuard> {
    use windows::Win32::Foundation::S_FALSE;
    use windows::Win32::System::Com::{
        COINIT_APARTMENTTHREADED, COINIT_DISABLE_OLE1DDE, COINIT_MULTITHREADED, CoInitializeEx,
    };

    let flags = match apartment {
        Apartment::STA => COINIT_APARTMENTTHREADED | COINIT_DISABLE_OLE1DDE,
        Apartment::MTA => COINIT_MULTITHREADED | COINIT_DISABLE_OLE1DDE,
    };
    match unsafe { CoInitializeEx(None, flags) } {
        Ok(()) => Ok(ComInitGuard),
        Err(e) if e.code() == S_FALSE => Ok(ComInitGuard),
        Err(e) => Err(anyhow!("CoInitializeEx failed: {e:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_work_fifo_and_returns_results() {
        let worker = ApartmentWorker::new(Apartment::MTA, Duration::from_secs(1)).unwrap();
        let order = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let order = order.clone();
            let got = worker
                .call_sync(move || -> Result<usize> {
                    let prev = order.fetch_add(1, Ordering::SeqCst);
                    Ok(prev)
                })
                .unwrap();
            assert_eq!(got, i);
        }
    }

    #[test]
    fn submit_after_dispose_fails() {
        let mut worker = ApartmentWorker::new(Apartment::MTA, Duration::from_secs(1)).unwrap();
        worker.dispose();
        let err = worker.call_sync(|| -> Result<()> { Ok(()) }).unwrap_err();
        assert!(err.downcast_ref::<CoreError>().is_some());
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let worker = ApartmentWorker::new(Apartment::MTA, Duration::from_secs(1)).unwrap();
        let _ = worker.call_sync(|| -> Result<()> { panic!("boom") });
        let got = worker.call_sync(|| -> Result<i32> { Ok(42) }).unwrap();
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn call_async_completes() {
        let worker = ApartmentWorker::new(Apartment::MTA, Duration::from_secs(1)).unwrap();
        let got = worker.call_async(|| -> Result<i32> { Ok(7) }).await.unwrap();
        assert_eq!(got, 7);
    }

    #[test]
    fn dispose_is_idempotent_and_bounded() {
        let mut worker = ApartmentWorker::new(Apartment::MTA, Duration::from_millis(200)).unwrap();
        worker.dispose();
        worker.dispose();
    }
}
