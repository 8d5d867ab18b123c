//! Caller-thread marshalling. Replaces a UI toolkit's dispatcher-queue /
//! synchronization-context mechanism with a narrow injected capability: the
//! Coordinator posts every public event through this before it reaches a
//! listener, so a GUI collaborator can always hop back to its own thread.

use std::sync::Arc;

/// A destination thread/loop that public events and async mutation
/// continuations should be delivered on. When absent, the Coordinator
/// dispatches synchronously on whatever thread produced the event.
pub trait SchedulingContext: Send + Sync {
    fn post(&self, work: Box<dyn FnOnce() + Send>);
}

/// Headless/test scheduling context: runs the work in place, synchronously,
/// on whichever thread called `post`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSchedulingContext;

impl SchedulingContext for NullSchedulingContext {
    fn post(&self, work: Box<dyn FnOnce() + Send>) {
        work();
    }
}

pub(crate) fn dispatch(scheduler: Option<&Arc<dyn SchedulingContext>>, work: Box<dyn FnOnce() + Send>) {
    match scheduler {
        Some(s) => s.post(work),
        None => work(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn null_context_runs_synchronously() {
        let ctx = NullSchedulingContext;
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ctx.post(Box::new(move || ran2.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn dispatch_with_no_scheduler_runs_in_place() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        dispatch(None, Box::new(move || ran2.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
