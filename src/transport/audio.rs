//! Local audio plumbing: capture, playback sink, and volume metering.
//!
//! Device I/O is feature-gated behind `audio-io` so the core builds on
//! hosts without a sound stack; without the feature, capture is a no-op
//! handle and playback goes to [`NullSink`]. Metering is always
//! available: it reads whatever PCM passes through, on its own cadence,
//! and never touches protocol or conversation state.

use std::collections::VecDeque;
#[cfg(feature = "audio-io")]
use std::sync::Arc;

use parking_lot::Mutex;

/// Window size for RMS volume computation, in samples.
const METER_WINDOW: usize = 256;

/// Rolling root-mean-square level over the most recent samples.
///
/// Values are normalized to `0.0..=1.0`. Shared between the audio
/// callback (writer) and the observer side (reader).
#[derive(Default)]
pub struct VolumeMeter {
    window: Mutex<VecDeque<f32>>,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed little-endian 16-bit PCM into the meter window.
    pub fn push_pcm16(&self, pcm: &[u8]) {
        let mut window = self.window.lock();
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32;
            window.push_back(sample);
            if window.len() > METER_WINDOW {
                window.pop_front();
            }
        }
    }

    /// Current RMS level; `0.0` when nothing has been heard yet.
    pub fn rms(&self) -> f32 {
        let window = self.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        let sum: f32 = window.iter().map(|s| s * s).sum();
        (sum / window.len() as f32).sqrt()
    }

    pub fn clear(&self) {
        self.window.lock().clear();
    }
}

// ── Playback ───────────────────────────────────────────────────────

/// Destination for decoded remote audio.
pub trait AudioSink: Send + Sync {
    /// Accept a block of little-endian 16-bit PCM.
    fn write(&self, pcm16: &[u8]);
}

/// Discards audio. Default sink when `audio-io` is off or the host
/// handles playback itself.
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&self, _pcm16: &[u8]) {}
}

// ── Capture ────────────────────────────────────────────────────────

/// Handle to a running microphone capture worker. Dropping or calling
/// [`CaptureHandle::stop`] releases the device; both are idempotent.
pub struct CaptureHandle {
    stop: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// A handle with no device behind it.
    pub fn disabled() -> Self {
        Self {
            stop: None,
            worker: None,
        }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start microphone capture, delivering mono PCM16 frames to `frames`
/// and feeding `meter` along the way.
///
/// The device stream is owned by a dedicated worker thread because the
/// underlying stream type is not `Send`; the thread parks on the stop
/// channel until teardown.
#[cfg(feature = "audio-io")]
pub fn start_capture(
    frames: tokio::sync::mpsc::Sender<Vec<u8>>,
    meter: Arc<VolumeMeter>,
) -> crate::error::Result<CaptureHandle> {
    use crate::error::SessionError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

    let worker = std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready_tx.send(Err("no input device available".into()));
            return;
        };
        let supported = match device.default_input_config() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };
        let channels = supported.channels() as usize;

        let stream = match device.build_input_stream(
            &supported.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut pcm = Vec::with_capacity(data.len() / channels * 2);
                for frame in data.chunks(channels) {
                    let mixed = frame.iter().sum::<f32>() / channels as f32;
                    let sample = (mixed.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    pcm.extend_from_slice(&sample.to_le_bytes());
                }
                meter.push_pcm16(&pcm);
                if frames.try_send(pcm).is_err() {
                    tracing::trace!("Capture frame dropped, channel full or closed");
                }
            },
            |e| tracing::error!(error = %e, "Capture stream error"),
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        // Park until stop() or the handle is dropped.
        let _ = stop_rx.recv();
        drop(stream);
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(CaptureHandle {
            stop: Some(stop_tx),
            worker: Some(worker),
        }),
        Ok(Err(e)) => Err(SessionError::transport(format!(
            "microphone unavailable: {e}"
        ))),
        Err(_) => Err(SessionError::transport("capture worker exited early")),
    }
}

/// Speaker playback sink backed by the default output device.
#[cfg(feature = "audio-io")]
pub struct SpeakerSink {
    queue: Arc<Mutex<VecDeque<i16>>>,
    meter: Arc<VolumeMeter>,
    handle: Mutex<CaptureHandle>,
}

#[cfg(feature = "audio-io")]
impl SpeakerSink {
    pub fn new(meter: Arc<VolumeMeter>) -> crate::error::Result<Self> {
        use crate::error::SessionError;
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let callback_queue = Arc::clone(&queue);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        let worker = std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = ready_tx.send(Err("no output device available".into()));
                return;
            };
            let supported = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let channels = supported.channels() as usize;

            let stream = match device.build_output_stream(
                &supported.into(),
                move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = callback_queue.lock();
                    for frame in out.chunks_mut(channels) {
                        let sample = queue
                            .pop_front()
                            .map(|s| s as f32 / i16::MAX as f32)
                            .unwrap_or(0.0);
                        for slot in frame {
                            *slot = sample;
                        }
                    }
                },
                |e| tracing::error!(error = %e, "Playback stream error"),
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                meter,
                handle: Mutex::new(CaptureHandle {
                    stop: Some(stop_tx),
                    worker: Some(worker),
                }),
            }),
            Ok(Err(e)) => Err(SessionError::transport(format!("speaker unavailable: {e}"))),
            Err(_) => Err(SessionError::transport("playback worker exited early")),
        }
    }

    pub fn stop(&self) {
        self.handle.lock().stop();
    }
}

#[cfg(feature = "audio-io")]
impl AudioSink for SpeakerSink {
    fn write(&self, pcm16: &[u8]) {
        self.meter.push_pcm16(pcm16);
        let mut queue = self.queue.lock();
        for chunk in pcm16.chunks_exact(2) {
            queue.push_back(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
