//! Public error taxonomy. Internal plumbing keeps using `anyhow::Result` the
//! way the COM-calling helpers always have; it is converted to `CoreError`
//! only at the Coordinator's public seam.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operation attempted after the core was disposed")]
    Disposed,

    #[error("endpoint not found or no longer active")]
    EndpointNotFound,

    #[error("default-device policy call failed (hresult {hresult:#010x})")]
    PolicyFailure { hresult: i32 },

    #[error("access denied by the OS (endpoint likely held exclusively)")]
    AccessDenied,

    #[error("meter tap open or restart failed")]
    TransientAudio,

    /// Propagated internally only, between the meter tap and the coordinator.
    /// Never returned from a public method.
    #[error("capture stream halted unexpectedly")]
    CaptureHalted,
}
