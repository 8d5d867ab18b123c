//! C5: the meter tap. Opens a shared-mode capture stream directly on a
//! capture endpoint (no `AUDCLNT_STREAMFLAGS_LOOPBACK` — this endpoint
//! already is the microphone, not a render tap), decodes whatever sample
//! format the endpoint's mix format reports, and reduces each buffer to a
//! single peak amplitude. The decode loop is a direct generalization of a
//! render-side buffer walker: instead of mixing and forwarding frames, it
//! only needs the magnitude.

use crate::types::EndpointId;
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Float32,
    Pcm16,
    Pcm24,
    Pcm32,
    Unsupported,
}

/// Peak absolute amplitude (`0.0..=1.0`) across `buffer`, decoded per
/// `format`/`channels`. A zero-length or not-frame-aligned buffer yields
/// `0.0` -- `chunks_exact` simply drops the partial tail, which is exactly
/// the degenerate-buffer behavior the meter wants: no spurious peak from a
/// torn read.
pub fn peak_of_buffer(buffer: &[u8], format: SampleFormat, _channels: u16) -> f32 {
    match format {
        SampleFormat::Float32 => peak_generic(buffer, 4, |b| {
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]).abs()
        }),
        SampleFormat::Pcm16 => peak_generic(buffer, 2, |b| {
            (i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0).abs()
        }),
        SampleFormat::Pcm24 => peak_generic(buffer, 3, |b| decode_pcm24_sample(b[0], b[1], b[2]).abs()),
        SampleFormat::Pcm32 => peak_generic(buffer, 4, |b| {
            (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / 2147483648.0).abs() as f32
        }),
        SampleFormat::Unsupported => 0.0,
    }
}

fn peak_generic(buffer: &[u8], width: usize, decode: impl Fn(&[u8]) -> f32) -> f32 {
    buffer
        .chunks_exact(width)
        .map(|chunk| decode(chunk))
        .fold(0.0f32, f32::max)
}

/// Decode a single little-endian 24-bit signed PCM sample (3 bytes, LSB
/// first) into a normalized `-1.0..=1.0` float, sign-extending from bit 23.
///
/// `0x800000` (most negative) -> `-1.0`.
/// `0x7FFFFF` (most positive) -> `8388607 / 8388608`.
pub fn decode_pcm24_sample(b0: u8, b1: u8, b2: u8) -> f32 {
    let mut v = (b0 as i32) | ((b1 as i32) << 8) | ((b2 as i32) << 16);
    if v & 0x0080_0000 != 0 {
        v |= -0x0100_0000i32; // sign-extend bit 23 through bit 31
    }
    v as f32 / 8_388_608.0
}

/// One decoded meter reading, delivered on every completed capture buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub peak_linear: f32,
}

pub trait MeterListener: Send + Sync {
    fn on_reading(&self, reading: MeterReading);
    /// The tap could not keep the stream open or it stopped unexpectedly;
    /// the Coordinator decides whether/when to retry.
    fn on_halted(&self);
}

/// A running meter tap on one endpoint. Dropping it stops the capture
/// thread.
pub trait MeterHandle: Send {
    fn stop(&mut self);
}

pub trait MeterSource: Send + Sync {
    fn start(&self, id: &EndpointId, listener: Arc<dyn MeterListener>) -> Result<Box<dyn MeterHandle>>;
}

#[cfg(target_os = "windows")]
pub mod windows_impl {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use windows::Win32::Media::Audio::{
        AUDCLNT_BUFFERFLAGS_SILENT, AUDCLNT_SHAREMODE_SHARED, IAudioCaptureClient, IAudioClient,
        IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
        WAVE_FORMAT_EXTENSIBLE, WAVE_FORMAT_IEEE_FLOAT, WAVE_FORMAT_PCM,
    };
    use windows::Win32::System::Com::{CLSCTX_ALL, CoCreateInstance};
    use windows::core::HSTRING;

    // ~5ms target latency (§4.5): this is a capture-only endpoint opened
    // directly, not a render-endpoint loopback, so no AUDCLNT_STREAMFLAGS_LOOPBACK.
    const BUFFER_DURATION_100NS: i64 = 5 * 10_000;

    fn resolve_format(fmt: &WAVEFORMATEX) -> SampleFormat {
        match fmt.wFormatTag as u32 {
            WAVE_FORMAT_IEEE_FLOAT => SampleFormat::Float32,
            WAVE_FORMAT_PCM if fmt.wBitsPerSample == 16 => SampleFormat::Pcm16,
            WAVE_FORMAT_PCM if fmt.wBitsPerSample == 24 => SampleFormat::Pcm24,
            WAVE_FORMAT_PCM if fmt.wBitsPerSample == 32 => SampleFormat::Pcm32,
            tag if tag == WAVE_FORMAT_EXTENSIBLE as u32 => {
                let ext = unsafe { &*(fmt as *const WAVEFORMATEX as *const WAVEFORMATEXTENSIBLE) };
                let sub = ext.SubFormat;
                const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: windows::core::GUID =
                    windows::core::GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);
                const KSDATAFORMAT_SUBTYPE_PCM: windows::core::GUID =
                    windows::core::GUID::from_u128(0x00000001_0000_0010_8000_00aa00389b71);
                if sub == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT {
                    SampleFormat::Float32
                } else if sub == KSDATAFORMAT_SUBTYPE_PCM {
                    match fmt.wBitsPerSample {
                        16 => SampleFormat::Pcm16,
                        24 => SampleFormat::Pcm24,
                        32 => SampleFormat::Pcm32,
                        _ => SampleFormat::Unsupported,
                    }
                } else {
                    SampleFormat::Unsupported
                }
            }
            _ => SampleFormat::Unsupported,
        }
    }

    struct CaptureHandle {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl MeterHandle for CaptureHandle {
        fn stop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
        }
    }

    impl Drop for CaptureHandle {
        fn drop(&mut self) {
            self.stop();
        }
    }

    pub struct WindowsMeterSource;

    impl WindowsMeterSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for WindowsMeterSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MeterSource for WindowsMeterSource {
        fn start(&self, id: &EndpointId, listener: Arc<dyn MeterListener>) -> Result<Box<dyn MeterHandle>> {
            let id = id.clone();
            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

            let thread = thread::Builder::new()
                .name("mic-meter-tap".into())
                .spawn(move || capture_loop(id, listener, stop_clone, ready_tx))
                .map_err(|e| anyhow!("failed to spawn meter capture thread: {e}"))?;

            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => return Err(anyhow!("meter tap failed to start: {msg}")),
                Err(_) => return Err(anyhow!("meter capture thread exited before starting")),
            }

            Ok(Box::new(CaptureHandle {
                stop,
                thread: Some(thread),
            }))
        }
    }

    fn capture_loop(
        id: EndpointId,
        listener: Arc<dyn MeterListener>,
        stop: Arc<AtomicBool>,
        ready_tx: mpsc::Sender<std::result::Result<(), String>>,
    ) {
        use windows::Win32::System::Com::{COINIT_MULTITHREADED, CoInitializeEx, CoUninitialize};

        let init = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if init.is_err() && init.0 != windows::Win32::Foundation::S_FALSE.0 {
            let _ = ready_tx.send(Err(format!("{init:?}")));
            return;
        }

        let setup = (|| -> Result<(IAudioClient, IAudioCaptureClient, SampleFormat, u16)> {
            let enumerator: IMMDeviceEnumerator =
                unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)? };
            let wide = HSTRING::from(id.as_str());
            let device: IMMDevice = unsafe { enumerator.GetDevice(&wide)? };
            let client: IAudioClient = unsafe { device.Activate(CLSCTX_ALL, None)? };
            let fmt_ptr = unsafe { client.GetMixFormat()? };
            let fmt = unsafe { &*fmt_ptr };
            let sample_format = resolve_format(fmt);
            let channels = fmt.nChannels;
            unsafe {
                client.Initialize(
                    AUDCLNT_SHAREMODE_SHARED,
                    0, // no loopback: this is the capture endpoint itself, not a render tap
                    BUFFER_DURATION_100NS,
                    0,
                    fmt_ptr,
                    None,
                )?;
            }
            let capture: IAudioCaptureClient = unsafe { client.GetService()? };
            unsafe { client.Start()? };
            unsafe {
                windows::Win32::System::Com::CoTaskMemFree(Some(fmt_ptr as *const _ as *const _));
            }
            Ok((client, capture, sample_format, channels))
        })();

        let (client, capture, sample_format, channels) = match setup {
            Ok(parts) => {
                let _ = ready_tx.send(Ok(()));
                parts
            }
            Err(e) => {
                let _ = ready_tx.send(Err(format!("{e:?}")));
                unsafe { CoUninitialize() };
                return;
            }
        };

        while !stop.load(Ordering::SeqCst) {
            let next = unsafe { capture.GetNextPacketSize() };
            let Ok(frames_available) = next else {
                listener.on_halted();
                break;
            };
            if frames_available == 0 {
                thread::sleep(Duration::from_millis(8));
                continue;
            }

            let mut data_ptr = std::ptr::null_mut();
            let mut frames = 0u32;
            let mut flags = 0u32;
            let got = unsafe {
                capture.GetBuffer(&mut data_ptr, &mut frames, &mut flags, None, None)
            };
            let Ok(()) = got else {
                listener.on_halted();
                break;
            };

            let peak = if flags & AUDCLNT_BUFFERFLAGS_SILENT.0 as u32 != 0 || data_ptr.is_null() {
                0.0
            } else {
                let bytes_per_frame = sample_format_width(sample_format) * channels as usize;
                let byte_len = frames as usize * bytes_per_frame;
                let slice = unsafe { std::slice::from_raw_parts(data_ptr, byte_len) };
                peak_of_buffer(slice, sample_format, channels)
            };

            unsafe {
                let _ = capture.ReleaseBuffer(frames);
            }

            listener.on_reading(MeterReading { peak_linear: peak });
        }

        unsafe {
            let _ = client.Stop();
            CoUninitialize();
        }
    }

    fn sample_format_width(format: SampleFormat) -> usize {
        match format {
            SampleFormat::Float32 | SampleFormat::Pcm32 => 4,
            SampleFormat::Pcm24 => 3,
            SampleFormat::Pcm16 => 2,
            SampleFormat::Unsupported => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_pcm24_min_value() {
        assert_eq!(decode_pcm24_sample(0x00, 0x00, 0x80), -1.0);
    }

    #[test]
    fn decode_pcm24_max_value() {
        let v = decode_pcm24_sample(0xFF, 0xFF, 0x7F);
        assert_eq!(v, 8_388_607.0 / 8_388_608.0);
    }

    #[test]
    fn decode_pcm24_zero() {
        assert_eq!(decode_pcm24_sample(0, 0, 0), 0.0);
    }

    #[test]
    fn peak_of_empty_buffer_is_zero() {
        assert_eq!(peak_of_buffer(&[], SampleFormat::Float32, 2), 0.0);
    }

    #[test]
    fn peak_of_misaligned_buffer_drops_tail() {
        // 5 bytes: one aligned f32 frame plus 1 stray byte, which chunks_exact drops.
        let mut buf = 0.5f32.to_le_bytes().to_vec();
        buf.push(0xFF);
        assert_eq!(peak_of_buffer(&buf, SampleFormat::Float32, 1), 0.5);
    }

    #[test]
    fn peak_of_buffer_picks_loudest_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0.1f32.to_le_bytes());
        buf.extend_from_slice(&(-0.9f32).to_le_bytes());
        buf.extend_from_slice(&0.3f32.to_le_bytes());
        let peak = peak_of_buffer(&buf, SampleFormat::Float32, 1);
        assert!((peak - 0.9).abs() < 1e-6);
    }

    #[test]
    fn peak_of_buffer_pcm16_full_scale() {
        let buf = i16::MIN.to_le_bytes();
        let peak = peak_of_buffer(&buf, SampleFormat::Pcm16, 1);
        assert!((peak - 1.0).abs() < 1e-4);
    }

    #[test]
    fn peak_of_buffer_unsupported_is_zero() {
        let buf = [1u8, 2, 3, 4];
        assert_eq!(peak_of_buffer(&buf, SampleFormat::Unsupported, 1), 0.0);
    }
}
