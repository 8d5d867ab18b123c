//! C3: capture-endpoint enumeration and property lookup.
//!
//! Per §9's "do not hold OS handles across event boundaries" guidance, the
//! trait never returns or accepts a live COM pointer; every query re-resolves
//! the endpoint by its [`EndpointId`] from scratch, which is what lets the
//! Coordinator cache snapshots across notification callbacks safely.

use crate::types::{DeviceRole, EndpointId};
use anyhow::Result;

/// The subset of device properties the core needs, independent of how they
/// were obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointQuery {
    pub id: EndpointId,
    pub name: String,
    pub is_default_console: bool,
    pub is_default_communications: bool,
    /// Human-readable summary such as "48.0 kHz, 16 bit, Stereo", derived
    /// from the endpoint's current mix format.
    pub format_tag: String,
}

pub trait EndpointEnumerator: Send + Sync {
    /// All active capture endpoints, in OS enumeration order.
    fn list(&self) -> Result<Vec<EndpointQuery>>;

    /// Whether `id` still names an active capture endpoint.
    fn exists(&self, id: &EndpointId) -> Result<bool>;

    /// Re-resolve and query a single endpoint. `Ok(None)` if it is gone.
    fn query(&self, id: &EndpointId) -> Result<Option<EndpointQuery>>;

    /// The default endpoint currently assigned to `role`, if any.
    fn default_for_role(&self, role: DeviceRole) -> Result<Option<EndpointId>>;
}

/// Render a sample rate the way the system tray flyout does: integer kHz
/// values print with no decimal, fractional ones with exactly one digit.
pub(crate) fn format_rate_khz(rate_hz: u32) -> String {
    let khz = rate_hz as f64 / 1000.0;
    if (khz.round() - khz).abs() < f64::EPSILON {
        format!("{khz:.0}")
    } else {
        format!("{khz:.1}")
    }
}

pub(crate) fn format_channels(channels: u16) -> String {
    match channels {
        1 => "Mono".to_string(),
        2 => "Stereo".to_string(),
        n => format!("{n}-ch"),
    }
}

/// `"{rate_kHz:0.#} kHz {bits}-bit {Mono|Stereo|N-ch}"`, e.g.
/// `"48 kHz 24-bit Stereo"` (§4.3).
pub(crate) fn format_tag(rate_hz: u32, bits_per_sample: u16, channels: u16) -> String {
    format!(
        "{} kHz {}-bit {}",
        format_rate_khz(rate_hz),
        bits_per_sample,
        format_channels(channels)
    )
}

/// Default format string used when per-property queries fail (§4.3).
pub const UNKNOWN_FORMAT: &str = "Unknown format";

#[cfg(target_os = "windows")]
pub mod windows_impl {
    use super::*;
    use anyhow::anyhow;
    use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
    use windows::Win32::Media::Audio::{
        DEVICE_STATE_ACTIVE, ERole, IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator, eCapture,
        eCommunications, eConsole,
    };
    use windows::Win32::Media::Audio::WAVEFORMATEX;
    use windows::Win32::System::Com::{CLSCTX_ALL, CoCreateInstance, STGM_READ};
    use windows::core::HSTRING;

    pub struct WindowsEndpointEnumerator;

    impl WindowsEndpointEnumerator {
        pub fn new() -> Self {
            Self
        }

        fn create_enumerator() -> Result<IMMDeviceEnumerator> {
            unsafe { Ok(CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)?) }
        }

        fn device_by_id(enumerator: &IMMDeviceEnumerator, id: &EndpointId) -> Result<IMMDevice> {
            let wide = HSTRING::from(id.as_str());
            unsafe { Ok(enumerator.GetDevice(&wide)?) }
        }

        fn query_device(enumerator: &IMMDeviceEnumerator, device: &IMMDevice) -> Result<EndpointQuery> {
            let id = unsafe { device.GetId()?.to_string()? };
            let name = read_friendly_name(device)?;

            let console_default = Self::default_id(enumerator, eConsole)?;
            let comms_default = Self::default_id(enumerator, eCommunications)?;

            let fmt = read_format_tag(device).unwrap_or_else(|_| UNKNOWN_FORMAT.to_string());

            Ok(EndpointQuery {
                is_default_console: console_default.as_deref() == Some(id.as_str()),
                is_default_communications: comms_default.as_deref() == Some(id.as_str()),
                id: EndpointId::from(id),
                name,
                format_tag: fmt,
            })
        }

        fn default_id(enumerator: &IMMDeviceEnumerator, role: ERole) -> Result<Option<String>> {
            match unsafe { enumerator.GetDefaultAudioEndpoint(eCapture, role) } {
                Ok(device) => {
                    let id = unsafe { device.GetId()?.to_string()? };
                    Ok(Some(id))
                }
                Err(e) if e.code().is_err() => Ok(None),
                Err(e) => Err(anyhow!(e)),
            }
        }
    }

    impl Default for WindowsEndpointEnumerator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EndpointEnumerator for WindowsEndpointEnumerator {
        fn list(&self) -> Result<Vec<EndpointQuery>> {
            unsafe {
                let enumerator = Self::create_enumerator()?;
                let collection =
                    enumerator.EnumAudioEndpoints(eCapture, DEVICE_STATE_ACTIVE)?;
                let count = collection.GetCount()?;
                let mut out = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let device = collection.Item(i)?;
                    out.push(Self::query_device(&enumerator, &device)?);
                }
                Ok(out)
            }
        }

        fn exists(&self, id: &EndpointId) -> Result<bool> {
            let enumerator = Self::create_enumerator()?;
            Ok(Self::device_by_id(&enumerator, id).is_ok())
        }

        fn query(&self, id: &EndpointId) -> Result<Option<EndpointQuery>> {
            let enumerator = Self::create_enumerator()?;
            match Self::device_by_id(&enumerator, id) {
                Ok(device) => Ok(Some(Self::query_device(&enumerator, &device)?)),
                Err(_) => Ok(None),
            }
        }

        fn default_for_role(&self, role: DeviceRole) -> Result<Option<EndpointId>> {
            let enumerator = Self::create_enumerator()?;
            let role = ERole(role as i32);
            Ok(Self::default_id(&enumerator, role)?.map(EndpointId::from))
        }
    }

    fn read_friendly_name(device: &IMMDevice) -> Result<String> {
        unsafe {
            let store = device.OpenPropertyStore(STGM_READ)?;
            let prop = store.GetValue(&PKEY_Device_FriendlyName)?;
            let value = crate::win_props::read_prop_string(&prop)?;
            Ok(value)
        }
    }

    fn read_format_tag(device: &IMMDevice) -> Result<String> {
        use windows::Win32::Media::Audio::IAudioClient;
        unsafe {
            let client: IAudioClient = device.Activate(CLSCTX_ALL, None)?;
            let fmt_ptr = client.GetMixFormat()?;
            let fmt: WAVEFORMATEX = *fmt_ptr;
            let tag = format_tag(fmt.nSamplesPerSec, fmt.wBitsPerSample, fmt.nChannels);
            windows::Win32::System::Com::CoTaskMemFree(Some(fmt_ptr as *const _ as *const _));
            Ok(tag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_rate_whole_khz_has_no_decimal() {
        assert_eq!(format_rate_khz(48_000), "48");
    }

    #[test]
    fn format_rate_fractional_khz_has_one_decimal() {
        assert_eq!(format_rate_khz(44_100), "44.1");
    }

    #[test]
    fn format_channels_labels() {
        assert_eq!(format_channels(1), "Mono");
        assert_eq!(format_channels(2), "Stereo");
        assert_eq!(format_channels(6), "6-ch");
    }

    #[test]
    fn format_tag_combines_parts() {
        assert_eq!(format_tag(48_000, 24, 2), "48 kHz 24-bit Stereo");
    }

    #[test]
    fn format_tag_fractional_rate() {
        assert_eq!(format_tag(44_100, 16, 1), "44.1 kHz 16-bit Mono");
    }
}
