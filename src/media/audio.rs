//! Mikrofon über cpal
//!
//! Öffnet das Standard-Eingabegerät, resampelt auf 48kHz Mono und schreibt
//! in einen Ring-Buffer. Der cpal-Stream ist nicht `Send`, daher lebt er auf
//! einem eigenen Thread, bis der zugehörige Track gestoppt wird.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::device::{AudioConstraints, AudioDevice, MediaError};
use super::track::{AudioTrack, LocalAudio, TrackKind};
use super::{FRAME_SIZE, SAMPLE_RATE};

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// CPAL MICROPHONE
// ============================================================================

pub struct CpalMicrophone {
    /// Aufgenommenes Audio (48kHz Mono PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Pegel (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self {
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            input_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Liest einen Frame (20ms) aufgenommenes Audio
    ///
    /// Pull-Schnittstelle für den Encoder der Plattform, der die Frames in
    /// den Opus-Track der Peer Connection schreibt. Liefert `None`, solange
    /// noch kein voller Frame gepuffert ist.
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    /// Letzter RMS-Pegel des Eingangs, auch bei stummgeschaltetem Track
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Baut den Stream auf dem aktuellen Thread und startet ihn
    fn open_stream(
        track: AudioTrack,
        capture_buffer: Arc<Mutex<HeapRb<f32>>>,
        input_level: Arc<Mutex<f32>>,
    ) -> Result<cpal::Stream, MediaError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(MediaError::NoDevice)?;
        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let source_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len().max(1) as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    // deaktivierter Track = stumm geschaltet
                    if !track.is_enabled() {
                        return;
                    }

                    let mono: Vec<f32> = data
                        .chunks(channels.max(1))
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();
                    let samples = resample_linear(&mono, source_rate, SAMPLE_RATE);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => MediaError::NoDevice,
                other => MediaError::Stream(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MediaError::Stream(e.to_string()))?;
        Ok(stream)
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioDevice for CpalMicrophone {
    async fn request_microphone(
        &self,
        constraints: AudioConstraints,
    ) -> Result<LocalAudio, MediaError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            tracing::debug!("cpal backend applies no voice processing; constraints are advisory");
        }

        let track = AudioTrack::new(TrackKind::Local);
        let stream_track = track.clone();
        let capture_buffer = Arc::clone(&self.capture_buffer);
        let input_level = Arc::clone(&self.input_level);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("intercom-capture".to_string())
            .spawn(move || {
                match Self::open_stream(stream_track.clone(), capture_buffer, input_level) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream_track.wait_ended();
                        drop(stream);
                        tracing::info!("Audio capture stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| MediaError::Stream(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(LocalAudio::new(track, constraints)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::Stream("capture thread exited".to_string())),
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Einfaches lineares Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;
    select_best_config(configs.collect())
}

/// Priorität: 48kHz F32 > F32 mit bester Rate
///
/// Der Capture-Callback ist auf `f32` typisiert, andere Formate scheiden aus.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;
    let float_configs: Vec<&SupportedStreamConfigRange> = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(config) = float_configs.iter().find(|c| supports_target(c)) {
        return Ok((*config).clone().with_sample_rate(target_rate).into());
    }

    float_configs
        .iter()
        .max_by_key(|c| c.max_sample_rate())
        .map(|c| (*c).clone().with_max_sample_rate().into())
        .ok_or_else(|| MediaError::UnsupportedConfig("Input device offers no f32 format".to_string()))
}
