//! C4: per-endpoint volume and mute control, plus the OS-pushed
//! volume/mute-changed notification that keeps a cached snapshot honest
//! between poll ticks.

use crate::types::EndpointId;
use anyhow::Result;
use std::sync::Arc;

pub trait VolumeChangeListener: Send + Sync {
    fn on_volume_changed(&self, id: &EndpointId, volume_scalar: f32, is_muted: bool);
}

/// Opaque handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(pub(crate) u64);

pub trait VolumeController: Send + Sync {
    fn get_volume(&self, id: &EndpointId) -> Result<f32>;
    fn set_volume(&self, id: &EndpointId, scalar: f32) -> Result<()>;
    fn is_muted(&self, id: &EndpointId) -> Result<bool>;
    fn set_muted(&self, id: &EndpointId, muted: bool) -> Result<()>;
    /// Returns the new muted state.
    fn toggle_mute(&self, id: &EndpointId) -> Result<bool>;

    fn subscribe(
        &self,
        id: &EndpointId,
        listener: Arc<dyn VolumeChangeListener>,
    ) -> Result<SubscriptionHandle>;
    fn unsubscribe(&self, id: &EndpointId, handle: SubscriptionHandle);
}

#[cfg(target_os = "windows")]
pub mod windows_impl {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use windows::Win32::Media::Audio::Endpoints::{
        IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
    };
    use windows::Win32::Media::Audio::{AUDIO_VOLUME_NOTIFICATION_DATA, IMMDevice};
    use windows::Win32::System::Com::CLSCTX_ALL;
    use windows::core::implement;

    struct Registration {
        volume: IAudioEndpointVolume,
        callback: IAudioEndpointVolumeCallback,
        listeners: Arc<Mutex<HashMap<u64, Arc<dyn VolumeChangeListener>>>>,
    }

    #[implement(IAudioEndpointVolumeCallback)]
    struct VolumeCallback {
        id: EndpointId,
        listeners: Arc<Mutex<HashMap<u64, Arc<dyn VolumeChangeListener>>>>,
    }

    impl IAudioEndpointVolumeCallback_Impl for VolumeCallback {
        fn OnNotify(&self, data: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
            if data.is_null() {
                return Ok(());
            }
            let data = unsafe { &*data };
            let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
            for listener in listeners {
                listener.on_volume_changed(&self.id, data.fMasterVolume, data.bMuted.as_bool());
            }
            Ok(())
        }
    }

    pub struct WindowsVolumeController {
        registrations: Mutex<HashMap<EndpointId, Registration>>,
        next_handle: AtomicU64,
    }

    impl WindowsVolumeController {
        pub fn new() -> Self {
            Self {
                registrations: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }
        }

        fn device(id: &EndpointId) -> Result<IMMDevice> {
            use windows::Win32::Media::Audio::{IMMDeviceEnumerator, MMDeviceEnumerator};
            use windows::Win32::System::Com::CoCreateInstance;
            use windows::core::HSTRING;

            let enumerator: IMMDeviceEnumerator =
                unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)? };
            let wide = HSTRING::from(id.as_str());
            Ok(unsafe { enumerator.GetDevice(&wide)? })
        }

        fn endpoint_volume(id: &EndpointId) -> Result<IAudioEndpointVolume> {
            let device = Self::device(id)?;
            Ok(unsafe { device.Activate(CLSCTX_ALL, None)? })
        }

        fn ensure_registered(&self, id: &EndpointId) -> Result<Arc<Mutex<HashMap<u64, Arc<dyn VolumeChangeListener>>>>> {
            let mut registrations = self.registrations.lock();
            if let Some(reg) = registrations.get(id) {
                return Ok(reg.listeners.clone());
            }
            let volume = Self::endpoint_volume(id)?;
            let listeners = Arc::new(Mutex::new(HashMap::new()));
            let callback: IAudioEndpointVolumeCallback = VolumeCallback {
                id: id.clone(),
                listeners: listeners.clone(),
            }
            .into();
            unsafe { volume.RegisterControlChangeNotify(&callback)? };
            registrations.insert(
                id.clone(),
                Registration {
                    volume,
                    callback,
                    listeners: listeners.clone(),
                },
            );
            Ok(listeners)
        }
    }

    impl Default for WindowsVolumeController {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VolumeController for WindowsVolumeController {
        fn get_volume(&self, id: &EndpointId) -> Result<f32> {
            let volume = Self::endpoint_volume(id)?;
            Ok(unsafe { volume.GetMasterVolumeLevelScalar()? })
        }

        fn set_volume(&self, id: &EndpointId, scalar: f32) -> Result<()> {
            let scalar = scalar.clamp(0.0, 1.0);
            let volume = Self::endpoint_volume(id)?;
            unsafe { volume.SetMasterVolumeLevelScalar(scalar, std::ptr::null())? };
            Ok(())
        }

        fn is_muted(&self, id: &EndpointId) -> Result<bool> {
            let volume = Self::endpoint_volume(id)?;
            Ok(unsafe { volume.GetMute()?.as_bool() })
        }

        fn set_muted(&self, id: &EndpointId, muted: bool) -> Result<()> {
            let volume = Self::endpoint_volume(id)?;
            unsafe { volume.SetMute(muted, std::ptr::null())? };
            Ok(())
        }

        fn toggle_mute(&self, id: &EndpointId) -> Result<bool> {
            let volume = Self::endpoint_volume(id)?;
            let current = unsafe { volume.GetMute()?.as_bool() };
            let next = !current;
            unsafe { volume.SetMute(next, std::ptr::null())? };
            Ok(next)
        }

        fn subscribe(
            &self,
            id: &EndpointId,
            listener: Arc<dyn VolumeChangeListener>,
        ) -> Result<SubscriptionHandle> {
            let listeners = self.ensure_registered(id)?;
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            listeners.lock().insert(handle, listener);
            Ok(SubscriptionHandle(handle))
        }

        fn unsubscribe(&self, id: &EndpointId, handle: SubscriptionHandle) {
            if let Some(reg) = self.registrations.lock().get(id) {
                reg.listeners.lock().remove(&handle.0);
            }
        }
    }

    impl Drop for WindowsVolumeController {
        fn drop(&mut self) {
            for (_, reg) in self.registrations.lock().drain() {
                unsafe {
                    let _ = reg.volume.UnregisterControlChangeNotify(&reg.callback);
                }
            }
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct EndpointState {
        volume: f32,
        muted: bool,
        listeners: HashMap<u64, Arc<dyn VolumeChangeListener>>,
    }

    /// In-memory stand-in used by Coordinator tests.
    pub struct FakeVolumeController {
        state: Mutex<HashMap<EndpointId, EndpointState>>,
        next_handle: std::sync::atomic::AtomicU64,
    }

    impl FakeVolumeController {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(HashMap::new()),
                next_handle: std::sync::atomic::AtomicU64::new(1),
            }
        }

        pub fn seed(&self, id: &EndpointId, volume: f32, muted: bool) {
            let mut state = self.state.lock();
            let entry = state.entry(id.clone()).or_default();
            entry.volume = volume;
            entry.muted = muted;
        }

        fn notify(entry: &EndpointState, id: &EndpointId) {
            for listener in entry.listeners.values() {
                listener.on_volume_changed(id, entry.volume, entry.muted);
            }
        }
    }

    impl Default for FakeVolumeController {
        fn default() -> Self {
            Self::new()
        }
    }

    impl VolumeController for FakeVolumeController {
        fn get_volume(&self, id: &EndpointId) -> Result<f32> {
            Ok(self.state.lock().entry(id.clone()).or_default().volume)
        }

        fn set_volume(&self, id: &EndpointId, scalar: f32) -> Result<()> {
            let mut state = self.state.lock();
            let entry = state.entry(id.clone()).or_default();
            entry.volume = scalar.clamp(0.0, 1.0);
            Self::notify(entry, id);
            Ok(())
        }

        fn is_muted(&self, id: &EndpointId) -> Result<bool> {
            Ok(self.state.lock().entry(id.clone()).or_default().muted)
        }

        fn set_muted(&self, id: &EndpointId, muted: bool) -> Result<()> {
            let mut state = self.state.lock();
            let entry = state.entry(id.clone()).or_default();
            entry.muted = muted;
            Self::notify(entry, id);
            Ok(())
        }

        fn toggle_mute(&self, id: &EndpointId) -> Result<bool> {
            let mut state = self.state.lock();
            let entry = state.entry(id.clone()).or_default();
            entry.muted = !entry.muted;
            let muted = entry.muted;
            Self::notify(entry, id);
            Ok(muted)
        }

        fn subscribe(
            &self,
            id: &EndpointId,
            listener: Arc<dyn VolumeChangeListener>,
        ) -> Result<SubscriptionHandle> {
            let handle = self.next_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.state
                .lock()
                .entry(id.clone())
                .or_default()
                .listeners
                .insert(handle, listener);
            Ok(SubscriptionHandle(handle))
        }

        fn unsubscribe(&self, id: &EndpointId, handle: SubscriptionHandle) {
            if let Some(entry) = self.state.lock().get_mut(id) {
                entry.listeners.remove(&handle.0);
            }
        }
    }

    #[test]
    fn toggle_mute_flips_and_notifies() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Flag(Arc<AtomicBool>);
        impl VolumeChangeListener for Flag {
            fn on_volume_changed(&self, _id: &EndpointId, _volume: f32, muted: bool) {
                self.0.store(muted, Ordering::SeqCst);
            }
        }

        let ctrl = FakeVolumeController::new();
        let id = EndpointId::from("ep-1");
        let notified = Arc::new(AtomicBool::new(false));
        ctrl.subscribe(&id, Arc::new(Flag(notified.clone()))).unwrap();

        let muted = ctrl.toggle_mute(&id).unwrap();
        assert!(muted);
        assert!(notified.load(Ordering::SeqCst));
    }
}
