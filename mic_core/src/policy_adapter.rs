//! C2: default-endpoint policy control, the one component that must run on
//! a dedicated STA thread ([`crate::apartment::ApartmentWorker`]) because
//! `IPolicyConfig` is undocumented and its threading contract is whatever
//! the shipping `audiosrv` implementation happens to tolerate.

use crate::error::CoreError;
use crate::types::{DeviceRole, EndpointId};
use anyhow::Result;
use std::sync::Arc;

/// Abstraction over "make this endpoint the default for a role", decoupled
/// from the COM plumbing so the Coordinator can be tested without Windows.
pub trait PolicyAdapter: Send + Sync {
    /// Set both the Console and Communications default to `id` in one call,
    /// matching what the system tray flow always wants. Per §9, there is no
    /// rollback if the second role's call fails after the first succeeds —
    /// the adapter reports the failure and leaves whichever defaults were
    /// already changed in place.
    fn set_default_endpoint(&self, id: &EndpointId, roles: &[DeviceRole]) -> Result<()>;
}

#[cfg(target_os = "windows")]
pub mod windows_impl {
    use super::*;
    use crate::apartment::{Apartment, ApartmentWorker};
    use crate::policy_config::{IPolicyConfig, POLICY_CONFIG_CLIENT};
    use anyhow::anyhow;
    use std::time::Duration;
    use windows::Win32::Media::Audio::ERole;
    use windows::Win32::System::Com::{CLSCTX_ALL, CoCreateInstance};
    use windows::core::{HSTRING, Interface};

    pub struct WindowsPolicyAdapter {
        worker: Arc<ApartmentWorker>,
    }

    impl WindowsPolicyAdapter {
        pub fn new(dispose_timeout: Duration) -> Result<Self> {
            let worker = ApartmentWorker::new(Apartment::STA, dispose_timeout)?;
            Ok(Self {
                worker: Arc::new(worker),
            })
        }

        pub fn worker(&self) -> &Arc<ApartmentWorker> {
            &self.worker
        }
    }

    impl PolicyAdapter for WindowsPolicyAdapter {
        fn set_default_endpoint(&self, id: &EndpointId, roles: &[DeviceRole]) -> Result<()> {
            let id = id.clone();
            let roles = roles.to_vec();
            self.worker.call_sync(move || -> Result<()> {
                let policy: IPolicyConfig =
                    unsafe { CoCreateInstance(&POLICY_CONFIG_CLIENT, None, CLSCTX_ALL)? };
                let wide = HSTRING::from(id.as_str());
                let mut first_err = None;
                for role in roles {
                    let hr = unsafe {
                        policy.SetDefaultEndpoint(&wide, ERole(role as i32))
                    };
                    if hr.is_err() && first_err.is_none() {
                        first_err = Some(classify_hresult(hr.0));
                    }
                }
                match first_err {
                    Some(e) => Err(anyhow!(e)),
                    None => Ok(()),
                }
            })
            .map_err(|e| match e.downcast::<CoreError>() {
                Ok(core_err) => anyhow!(core_err),
                Err(e) => e,
            })
        }
    }

    impl Clone for WindowsPolicyAdapter {
        fn clone(&self) -> Self {
            Self {
                worker: self.worker.clone(),
            }
        }
    }

    fn classify_hresult(hresult: i32) -> CoreError {
        const E_ACCESSDENIED: i32 = 0x8007_0005_u32 as i32;
        const E_NOTFOUND: i32 = 0x8007_0490_u32 as i32;

        match hresult {
            E_ACCESSDENIED => CoreError::AccessDenied,
            E_NOTFOUND => CoreError::EndpointNotFound,
            other => CoreError::PolicyFailure { hresult: other },
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn classifies_known_hresults() {
            assert!(matches!(
                classify_hresult(0x8007_0005_u32 as i32),
                CoreError::AccessDenied
            ));
            assert!(matches!(
                classify_hresult(0x8007_0490_u32 as i32),
                CoreError::EndpointNotFound
            ));
            assert!(matches!(
                classify_hresult(0x8004_5000_u32 as i32),
                CoreError::PolicyFailure { .. }
            ));
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records every call for assertions; always succeeds.
    #[derive(Default)]
    pub struct RecordingPolicyAdapter {
        pub calls: Mutex<Vec<(EndpointId, Vec<DeviceRole>)>>,
    }

    impl PolicyAdapter for RecordingPolicyAdapter {
        fn set_default_endpoint(&self, id: &EndpointId, roles: &[DeviceRole]) -> Result<()> {
            self.calls.lock().push((id.clone(), roles.to_vec()));
            Ok(())
        }
    }
}
