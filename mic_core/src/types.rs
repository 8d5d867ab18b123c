//! Core data model: endpoint identity, device roles, and the immutable
//! snapshot value shared by the cache, the coordinator, and callers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque OS-assigned endpoint identifier. Immutable once obtained; the
/// primary key every other component keys its state by. Components never
/// hold an OS handle across an event boundary — they re-resolve by this ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Default-device role. Only `Console` and `Communications` are first-class;
/// `Multimedia` is accepted as an argument but the core never reasons about
/// it separately. Numeric values match the OS `ERole` enumeration exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceRole {
    Console = 0,
    Multimedia = 1,
    Communications = 2,
}

/// Point-in-time, immutable view of one capture endpoint. A snapshot is
/// never mutated in place; state changes are expressed by producing a new
/// one and emitting it through an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub id: EndpointId,
    pub name: String,
    pub is_default_console: bool,
    pub is_default_communications: bool,
    pub is_muted: bool,
    pub volume_scalar: f32,
    pub format_tag: String,
    pub input_level_percent: f32,
}

impl EndpointSnapshot {
    /// Clamp to the invariants every snapshot must satisfy before it leaves
    /// the core: `0 <= volume_scalar <= 1`, `0 <= input_level_percent <= 100`.
    pub fn normalized(mut self) -> Self {
        self.volume_scalar = clamp_unit(self.volume_scalar);
        self.input_level_percent = self.input_level_percent.clamp(0.0, 100.0);
        self
    }
}

pub(crate) fn clamp_unit(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_unit_saturates() {
        assert_eq!(clamp_unit(-1.0), 0.0);
        assert_eq!(clamp_unit(2.0), 1.0);
        assert_eq!(clamp_unit(0.5), 0.5);
    }

    #[test]
    fn endpoint_id_displays_as_raw_string() {
        let id = EndpointId::from("{abc-123}");
        assert_eq!(id.to_string(), "{abc-123}");
        assert_eq!(id.as_str(), "{abc-123}");
    }
}
