//! C7: OS device-change notifications, filtered to the capture data-flow.
//! Generalizes the teacher's `IMMNotificationClient` watcher, narrowing the
//! flow filter from "any device" to `eCapture` only and dropping the
//! render-specific plumbing.

use crate::types::{DeviceRole, EndpointId};
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    /// A capture endpoint was added, removed, or changed state.
    DeviceListChanged,
    /// The default capture endpoint for `role` is now `id` (or `None` if no
    /// capture endpoint is currently the default for that role).
    DefaultDeviceChanged {
        role: DeviceRole,
        id: Option<EndpointId>,
    },
}

pub trait NotificationListener: Send + Sync {
    fn on_event(&self, event: NotificationEvent);
}

/// A running registration. Dropping it unregisters from the OS.
pub trait NotificationHandle: Send {
    fn stop(&mut self);
}

pub trait NotificationSource: Send + Sync {
    fn start(&self, listener: Arc<dyn NotificationListener>) -> Result<Box<dyn NotificationHandle>>;
}

#[cfg(target_os = "windows")]
pub mod windows_impl {
    use super::*;
    use anyhow::anyhow;
    use windows::Win32::Media::Audio::{
        DEVICE_STATE, EDataFlow, ERole, IMMDeviceEnumerator, IMMNotificationClient,
        IMMNotificationClient_Impl, MMDeviceEnumerator, eCapture, eCommunications, eConsole,
    };
    use windows::Win32::System::Com::{CLSCTX_ALL, CoCreateInstance};
    use windows::core::{PCWSTR, implement};

    #[implement(IMMNotificationClient)]
    struct NotificationClient {
        listener: Arc<dyn NotificationListener>,
    }

    impl IMMNotificationClient_Impl for NotificationClient {
        fn OnDeviceStateChanged(
            &self,
            _device_id: &PCWSTR,
            _new_state: DEVICE_STATE,
        ) -> windows::core::Result<()> {
            self.listener.on_event(NotificationEvent::DeviceListChanged);
            Ok(())
        }

        fn OnDeviceAdded(&self, _device_id: &PCWSTR) -> windows::core::Result<()> {
            self.listener.on_event(NotificationEvent::DeviceListChanged);
            Ok(())
        }

        fn OnDeviceRemoved(&self, _device_id: &PCWSTR) -> windows::core::Result<()> {
            self.listener.on_event(NotificationEvent::DeviceListChanged);
            Ok(())
        }

        fn OnDefaultDeviceChanged(
            &self,
            flow: EDataFlow,
            role: ERole,
            new_default_device_id: &PCWSTR,
        ) -> windows::core::Result<()> {
            if flow != eCapture {
                return Ok(());
            }
            let role = match role {
                r if r == eConsole => DeviceRole::Console,
                r if r == eCommunications => DeviceRole::Communications,
                _ => return Ok(()),
            };
            let id = if new_default_device_id.is_null() {
                None
            } else {
                unsafe { new_default_device_id.to_string() }
                    .ok()
                    .map(EndpointId::from)
            };
            self.listener
                .on_event(NotificationEvent::DefaultDeviceChanged { role, id });
            Ok(())
        }

        fn OnPropertyValueChanged(
            &self,
            _device_id: &PCWSTR,
            _key: &windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY,
        ) -> windows::core::Result<()> {
            self.listener.on_event(NotificationEvent::DeviceListChanged);
            Ok(())
        }
    }

    struct Registration {
        enumerator: IMMDeviceEnumerator,
        client: IMMNotificationClient,
    }

    impl NotificationHandle for Registration {
        fn stop(&mut self) {
            unsafe {
                let _ = self.enumerator.UnregisterEndpointNotificationCallback(&self.client);
            }
        }
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            self.stop();
        }
    }

    pub struct WindowsNotificationSource;

    impl WindowsNotificationSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for WindowsNotificationSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NotificationSource for WindowsNotificationSource {
        fn start(&self, listener: Arc<dyn NotificationListener>) -> Result<Box<dyn NotificationHandle>> {
            let enumerator: IMMDeviceEnumerator =
                unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)? };
            let client: IMMNotificationClient = NotificationClient { listener }.into();
            unsafe {
                enumerator
                    .RegisterEndpointNotificationCallback(&client)
                    .map_err(|e| anyhow!(e))?;
            }
            Ok(Box::new(Registration { enumerator, client }))
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    pub struct FakeNotificationSource {
        listener: Mutex<Option<Arc<dyn NotificationListener>>>,
    }

    impl FakeNotificationSource {
        pub fn new() -> Self {
            Self {
                listener: Mutex::new(None),
            }
        }

        pub fn emit(&self, event: NotificationEvent) {
            if let Some(listener) = self.listener.lock().as_ref() {
                listener.on_event(event);
            }
        }
    }

    impl Default for FakeNotificationSource {
        fn default() -> Self {
            Self::new()
        }
    }

    struct FakeHandle;
    impl NotificationHandle for FakeHandle {
        fn stop(&mut self) {}
    }

    impl NotificationSource for FakeNotificationSource {
        fn start(&self, listener: Arc<dyn NotificationListener>) -> Result<Box<dyn NotificationHandle>> {
            *self.listener.lock() = Some(listener);
            Ok(Box::new(FakeHandle))
        }
    }
}
