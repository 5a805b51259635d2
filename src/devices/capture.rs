//! Запись с микрофона

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tracing::{debug, error};

use super::{CaptureDevice, CapturedFrame};
use crate::error::{ClientError, Result};
use crate::utils::audio::{f32_to_i16, OPUS_FRAME_SIZE, SAMPLE_RATE_HZ};

/// Сколько сэмплов держим до того, как начнем терять данные (1 секунда)
const MAX_BUFFERED_SAMPLES: usize = SAMPLE_RATE_HZ as usize;
const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct CaptureState {
    samples: VecDeque<i16>,
    overflowed: bool,
}

/// Буфер между callback'ом cpal и читателем кадров
#[derive(Debug, Default)]
struct CaptureBuffer {
    state: Mutex<CaptureState>,
    ready: Condvar,
}

impl CaptureBuffer {
    fn push(&self, samples: impl IntoIterator<Item = i16>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.samples.extend(samples);
        if state.samples.len() > MAX_BUFFERED_SAMPLES {
            let excess = state.samples.len() - MAX_BUFFERED_SAMPLES;
            state.samples.drain(..excess);
            state.overflowed = true;
        }
        self.ready.notify_all();
    }

    fn take_frame(&self, timeout: Duration) -> Result<CapturedFrame> {
        let state = self
            .state
            .lock()
            .map_err(|_| ClientError::Audio("capture buffer poisoned".to_string()))?;
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.samples.len() < OPUS_FRAME_SIZE)
            .map_err(|_| ClientError::Audio("capture buffer poisoned".to_string()))?;

        if state.samples.len() < OPUS_FRAME_SIZE {
            return Err(ClientError::Audio(format!(
                "no audio from input device for {:?}",
                timeout
            )));
        }

        let samples = state.samples.drain(..OPUS_FRAME_SIZE).collect();
        let overflowed = std::mem::take(&mut state.overflowed);
        Ok(CapturedFrame {
            samples,
            overflowed,
        })
    }

    fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.samples.clear();
            state.overflowed = false;
        }
    }
}

/// Микрофон по умолчанию, 48 kHz
pub struct MicrophoneCapture {
    device: Device,
    config: StreamConfig,
    buffer: Arc<CaptureBuffer>,
    stream: Option<Stream>,
}

impl MicrophoneCapture {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| ClientError::Audio("no input device available".to_string()))?;

        let rate = SampleRate(SAMPLE_RATE_HZ);
        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        };

        let configs: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| ClientError::Audio(e.to_string()))?
            .filter(|c| supports_rate(c))
            .collect();

        // Моно предпочтительнее, иначе сводим каналы
        let supported = configs
            .iter()
            .find(|c| c.channels() == 1)
            .or_else(|| configs.first())
            .cloned()
            .ok_or_else(|| {
                ClientError::Audio(format!("input device does not support {} Hz", SAMPLE_RATE_HZ))
            })?;

        let config = supported.with_sample_rate(rate).config();

        debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE_HZ,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            buffer: Arc::new(CaptureBuffer::default()),
            stream: None,
        })
    }
}

impl CaptureDevice for MicrophoneCapture {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let channels = usize::from(self.config.channels.max(1));

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    buffer.push(data.chunks(channels).map(|frame| {
                        let sum: f32 = frame.iter().sum();
                        f32_to_i16(sum / frame.len() as f32)
                    }));
                },
                |err| {
                    error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| ClientError::Audio(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ClientError::Audio(e.to_string()))?;
        self.stream = Some(stream);

        debug!("audio capture started");
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CapturedFrame> {
        if self.stream.is_none() {
            return Err(ClientError::Audio("capture is not started".to_string()));
        }
        self.buffer.take_frame(READ_TIMEOUT)
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.buffer.clear();
            debug!("audio capture stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_returns_exactly_one_frame() {
        let buffer = CaptureBuffer::default();
        buffer.push(0..(OPUS_FRAME_SIZE as i16 + 10));

        let frame = buffer.take_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.samples.len(), OPUS_FRAME_SIZE);
        assert_eq!(frame.samples[0], 0);
        assert!(!frame.overflowed);

        // Остаток меньше кадра
        assert!(buffer.take_frame(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_overflow_drops_oldest_and_sets_flag_once() {
        let buffer = CaptureBuffer::default();
        buffer.push(std::iter::repeat(1i16).take(MAX_BUFFERED_SAMPLES));
        buffer.push(std::iter::repeat(2i16).take(OPUS_FRAME_SIZE));

        let first = buffer.take_frame(Duration::from_millis(10)).unwrap();
        assert!(first.overflowed);
        assert!(first.samples.iter().all(|&s| s == 1));

        let second = buffer.take_frame(Duration::from_millis(10)).unwrap();
        assert!(!second.overflowed);
    }

    #[test]
    fn test_clear_resets_overflow() {
        let buffer = CaptureBuffer::default();
        buffer.push(std::iter::repeat(0i16).take(MAX_BUFFERED_SAMPLES + 1));
        buffer.clear();
        buffer.push(std::iter::repeat(0i16).take(OPUS_FRAME_SIZE));
        assert!(!buffer.take_frame(Duration::from_millis(10)).unwrap().overflowed);
    }
}
