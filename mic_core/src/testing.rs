//! In-memory fakes for every dependency-injection seam, shared by this
//! crate's own unit tests and exposed (behind `#[cfg(test)]` visibility
//! internally, `pub` here for out-of-crate integration tests) so a
//! downstream caller can exercise the full [`crate::coordinator::Coordinator`]
//! without Windows.

pub use crate::notification::test_support::FakeNotificationSource;
pub use crate::policy_adapter::test_support::RecordingPolicyAdapter;
pub use crate::volume::test_support::FakeVolumeController;

use crate::enumerator::{EndpointEnumerator, EndpointQuery};
use crate::meter::{MeterHandle, MeterListener, MeterSource};
use crate::types::{DeviceRole, EndpointId};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// A fixed, mutable-by-test list of capture endpoints.
pub struct FakeEnumerator {
    endpoints: Mutex<Vec<EndpointQuery>>,
}

impl FakeEnumerator {
    pub fn new(endpoints: Vec<EndpointQuery>) -> Self {
        Self {
            endpoints: Mutex::new(endpoints),
        }
    }

    pub fn set(&self, endpoints: Vec<EndpointQuery>) {
        *self.endpoints.lock() = endpoints;
    }
}

impl EndpointEnumerator for FakeEnumerator {
    fn list(&self) -> Result<Vec<EndpointQuery>> {
        Ok(self.endpoints.lock().clone())
    }

    fn exists(&self, id: &EndpointId) -> Result<bool> {
        Ok(self.endpoints.lock().iter().any(|q| &q.id == id))
    }

    fn query(&self, id: &EndpointId) -> Result<Option<EndpointQuery>> {
        Ok(self.endpoints.lock().iter().find(|q| &q.id == id).cloned())
    }

    fn default_for_role(&self, role: DeviceRole) -> Result<Option<EndpointId>> {
        let endpoints = self.endpoints.lock();
        let found = endpoints.iter().find(|q| match role {
            DeviceRole::Console => q.is_default_console,
            DeviceRole::Communications => q.is_default_communications,
            DeviceRole::Multimedia => false,
        });
        Ok(found.map(|q| q.id.clone()))
    }
}

/// A meter source whose handle does nothing; tests drive readings directly
/// by holding onto the `Arc<dyn MeterListener>` passed to `start`.
pub struct FakeMeterSource {
    last_listener: Mutex<Option<Arc<dyn MeterListener>>>,
}

impl FakeMeterSource {
    pub fn new() -> Self {
        Self {
            last_listener: Mutex::new(None),
        }
    }

    pub fn listener(&self) -> Option<Arc<dyn MeterListener>> {
        self.last_listener.lock().clone()
    }
}

impl Default for FakeMeterSource {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeMeterHandle;
impl MeterHandle for FakeMeterHandle {
    fn stop(&mut self) {}
}

impl MeterSource for FakeMeterSource {
    fn start(&self, _id: &EndpointId, listener: Arc<dyn MeterListener>) -> Result<Box<dyn MeterHandle>> {
        *self.last_listener.lock() = Some(listener);
        Ok(Box::new(FakeMeterHandle))
    }
}
