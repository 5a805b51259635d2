//! Аудио устройства: микрофон и динамик

pub mod capture;
pub mod playback;

pub use capture::MicrophoneCapture;
pub use playback::SpeakerPlayback;

use crate::error::Result;

/// Один прочитанный с устройства кадр
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub samples: Vec<i16>,
    /// Устройство потеряло часть данных до этого кадра
    pub overflowed: bool,
}

/// Источник 20 мс PCM кадров
pub trait CaptureDevice {
    fn start(&mut self) -> Result<()>;
    /// Блокирует до появления полного кадра
    fn read_frame(&mut self) -> Result<CapturedFrame>;
    fn stop(&mut self);
}

/// Устройство вывода PCM
pub trait PlaybackDevice {
    fn write(&mut self, pcm: &[i16]) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}
