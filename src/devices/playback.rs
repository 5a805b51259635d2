//! Воспроизведение на динамик

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tracing::{debug, error, warn};

use super::PlaybackDevice;
use crate::error::{ClientError, Result};
use crate::utils::audio::{i16_to_f32, SAMPLE_RATE_HZ};

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Запас сверх длительности очереди при ожидании доигрывания
const DRAIN_MARGIN: Duration = Duration::from_millis(500);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn queued_len(queue: &SampleQueue) -> usize {
    queue.lock().map(|q| q.len()).unwrap_or(0)
}

/// Ждет, пока callback выберет всю очередь
///
/// Ожидание ограничено длительностью очереди плюс `margin`.
/// Возвращает `true`, если очередь опустела.
fn wait_drained(queue: &SampleQueue, sample_rate: u32, margin: Duration) -> bool {
    let queued = queued_len(queue);
    if queued == 0 {
        return true;
    }
    let queued_ms = (queued as u64).saturating_mul(1000) / u64::from(sample_rate.max(1));
    let deadline = Instant::now() + Duration::from_millis(queued_ms) + margin;

    while queued_len(queue) > 0 {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(DRAIN_POLL_INTERVAL);
    }
    true
}

/// Динамик по умолчанию, открывается на всю сессию
pub struct SpeakerPlayback {
    queue: SampleQueue,
    stream: Option<Stream>,
}

impl SpeakerPlayback {
    /// Открывает устройство вывода и сразу запускает поток
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ClientError::Audio("no output device available".to_string()))?;

        let rate = SampleRate(SAMPLE_RATE_HZ);
        let supported = device
            .supported_output_configs()
            .map_err(|e| ClientError::Audio(e.to_string()))?
            .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .or_else(|| {
                // Fallback: stereo, дублируем сэмпл в оба канала
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
                })
            })
            .ok_or_else(|| ClientError::Audio("no suitable output config found".to_string()))?;

        let config = supported.with_sample_rate(rate).config();
        let channels = usize::from(config.channels);
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let callback_queue = Arc::clone(&queue);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = callback_queue.lock().ok();
                    for frame in data.chunks_mut(channels) {
                        let sample = queue
                            .as_mut()
                            .and_then(|q| q.pop_front())
                            .unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                |err| {
                    error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| ClientError::Audio(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ClientError::Audio(e.to_string()))?;

        debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE_HZ,
            channels = config.channels,
            "audio playback started"
        );

        Ok(Self {
            queue,
            stream: Some(stream),
        })
    }
}

impl PlaybackDevice for SpeakerPlayback {
    fn write(&mut self, pcm: &[i16]) -> Result<()> {
        if self.stream.is_none() {
            return Err(ClientError::Audio("playback is stopped".to_string()));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| ClientError::Audio("playback queue poisoned".to_string()))?;
        queue.extend(pcm.iter().copied().map(i16_to_f32));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        if !wait_drained(&self.queue, SAMPLE_RATE_HZ, DRAIN_MARGIN) {
            warn!(
                remaining = queued_len(&self.queue),
                "audio output did not drain in time"
            );
        }
        let paused = stream
            .pause()
            .map_err(|e| ClientError::Audio(e.to_string()));
        drop(stream);
        debug!("audio playback stopped");
        paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(samples: usize) -> SampleQueue {
        Arc::new(Mutex::new(std::iter::repeat(0.5).take(samples).collect()))
    }

    #[test]
    fn test_wait_drained_waits_for_consumer() {
        let queue = queue_with(960);
        let consumer = Arc::clone(&queue);
        // Как output callback: выбираем по 10 мс
        let handle = std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_millis(5));
            let mut queue = consumer.lock().unwrap();
            let take = queue.len().min(480);
            queue.drain(..take).for_each(drop);
            if queue.is_empty() {
                break;
            }
        });

        assert!(wait_drained(&queue, SAMPLE_RATE_HZ, DRAIN_MARGIN));
        assert_eq!(queued_len(&queue), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_drained_gives_up_after_deadline() {
        // 480 сэмплов = 10 мс
        let queue = queue_with(480);
        let started = Instant::now();

        assert!(!wait_drained(&queue, SAMPLE_RATE_HZ, Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(60));
        // Очередь не очищается
        assert_eq!(queued_len(&queue), 480);
    }

    #[test]
    fn test_wait_drained_empty_queue() {
        let queue = queue_with(0);
        assert!(wait_drained(&queue, SAMPLE_RATE_HZ, DRAIN_MARGIN));
    }
}
