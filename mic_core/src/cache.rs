//! C8: a short-TTL, read-mostly cache of the full endpoint snapshot list.
//! Collapsing every notification burst into at most one re-enumeration per
//! TTL window is what keeps the Coordinator cheap to poll from a UI tick.

use crate::types::EndpointSnapshot;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

pub struct SnapshotCache {
    ttl: Duration,
    state: RwLock<Option<(Instant, Vec<EndpointSnapshot>)>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Return the cached snapshots if still fresh, otherwise `None`.
    pub fn get(&self) -> Option<Vec<EndpointSnapshot>> {
        let state = self.state.read();
        match state.as_ref() {
            Some((stamp, snapshots)) if stamp.elapsed() < self.ttl => Some(snapshots.clone()),
            _ => None,
        }
    }

    pub fn put(&self, snapshots: Vec<EndpointSnapshot>) {
        *self.state.write() = Some((Instant::now(), snapshots));
    }

    /// Force the next `get()` to miss, regardless of TTL. Called whenever a
    /// notification observes a change the cached view can't yet reflect.
    pub fn invalidate(&self) {
        *self.state.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointId;

    fn sample(id: &str) -> EndpointSnapshot {
        EndpointSnapshot {
            id: EndpointId::from(id),
            name: id.to_string(),
            is_default_console: false,
            is_default_communications: false,
            is_muted: false,
            volume_scalar: 1.0,
            format_tag: "48 kHz 16-bit Stereo".into(),
            input_level_percent: 0.0,
        }
    }

    #[test]
    fn miss_before_any_put() {
        let cache = SnapshotCache::new(Duration::from_millis(100));
        assert!(cache.get().is_none());
    }

    #[test]
    fn hit_within_ttl() {
        let cache = SnapshotCache::new(Duration::from_millis(100));
        cache.put(vec![sample("a")]);
        assert_eq!(cache.get().unwrap().len(), 1);
    }

    #[test]
    fn miss_after_ttl_expires() {
        let cache = SnapshotCache::new(Duration::from_millis(10));
        cache.put(vec![sample("a")]);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get().is_none());
    }

    #[test]
    fn invalidate_forces_a_miss() {
        let cache = SnapshotCache::new(Duration::from_secs(10));
        cache.put(vec![sample("a")]);
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
