//! Обработка аудио ответов сервера
//!
//! Бинарное сообщение от сервера - это чанк TTS аудио без обертки.
//! Формат определяем по magic bytes и сверяем с тем, что согласовали в hello:
//! если сигнатура однозначная и расходится с согласованным форматом, верим байтам.

use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::AudioFormat;
use crate::devices::PlaybackDevice;
use crate::utils::audio::{hex_prefix, FrameDecoder};

pub const MP3_FILE: &str = "response.mp3";
/// Однозначный Opus, который не удалось декодировать
pub const UNDECODABLE_FILE: &str = "response_unknown.bin";
/// Opus "по договоренности", который не удалось декодировать
pub const OPUS_ERROR_FILE: &str = "response_opus_error.bin";

const HEX_PREVIEW_BYTES: usize = 10;

/// Определяет формат по первым байтам
///
/// - "ID3" или MPEG frame sync (0xFF и старшие 3 бита следующего байта) - MP3
/// - "OggS" - Opus в Ogg контейнере
pub fn sniff_format(payload: &[u8]) -> Option<AudioFormat> {
    if payload.starts_with(b"ID3") {
        return Some(AudioFormat::Mp3);
    }
    if payload.len() >= 2 && payload[0] == 0xFF && (payload[1] & 0xE0) == 0xE0 {
        return Some(AudioFormat::Mp3);
    }
    if payload.starts_with(b"OggS") {
        return Some(AudioFormat::Opus);
    }
    None
}

/// Что делать с чанком
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRoute {
    SaveMp3,
    PlayOpus,
    /// Неизвестный согласованный формат, сохраняем как есть
    Save { extension: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub route: ResponseRoute,
    pub sniffed: Option<AudioFormat>,
    /// Сигнатура расходится с согласованным форматом
    pub mismatch: bool,
}

pub fn classify(payload: &[u8], negotiated: &str) -> Classification {
    let negotiated = negotiated.trim().to_ascii_lowercase();
    let sniffed = sniff_format(payload);
    let mismatch = sniffed.is_some_and(|format| format.as_str() != negotiated);

    let route = match sniffed.or_else(|| AudioFormat::from_name(&negotiated)) {
        Some(AudioFormat::Mp3) => ResponseRoute::SaveMp3,
        Some(AudioFormat::Opus) => ResponseRoute::PlayOpus,
        None => ResponseRoute::Save {
            extension: file_extension(&negotiated),
        },
    };

    Classification {
        route,
        sniffed,
        mismatch,
    }
}

impl Classification {
    /// Текст предупреждения, если сигнатура перебила согласованный формат
    pub fn mismatch_warning(&self, negotiated: &str) -> Option<String> {
        match self.sniffed {
            Some(format) if self.mismatch => Some(format!(
                "Received {} audio, but session negotiated {}; using {}",
                format, negotiated, format
            )),
            _ => None,
        }
    }
}

/// Имя формата от сервера не должно выводить за пределы output_dir
fn file_extension(format: &str) -> String {
    let extension: String = format
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if extension.is_empty() {
        "bin".to_string()
    } else {
        extension
    }
}

/// Результат обработки одного чанка
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Played { samples: usize },
    Saved { path: PathBuf },
    /// Opus не декодировался, сырые байты сохранены для анализа
    DecodeFailed { path: PathBuf },
    /// Даже сохранить не получилось
    Dropped,
}

/// Маршрутизирует аудио чанки: проигрывает Opus, сохраняет остальное
pub struct ResponseAudio<'a> {
    decoder: &'a mut dyn FrameDecoder,
    output: &'a mut dyn PlaybackDevice,
    output_dir: &'a Path,
    negotiated: &'a str,
}

impl<'a> ResponseAudio<'a> {
    pub fn new(
        decoder: &'a mut dyn FrameDecoder,
        output: &'a mut dyn PlaybackDevice,
        output_dir: &'a Path,
        negotiated: &'a str,
    ) -> Self {
        Self {
            decoder,
            output,
            output_dir,
            negotiated,
        }
    }

    pub async fn handle(&mut self, payload: &[u8]) -> ChunkOutcome {
        info!("Received audio: {} bytes", payload.len());

        let classification = classify(payload, self.negotiated);
        if let Some(warning) = classification.mismatch_warning(self.negotiated) {
            warn!("{}", warning);
        } else if let Some(format) = classification.sniffed {
            info!("Detected {} format by signature", format);
        } else {
            warn!(
                "Could not determine audio format by magic bytes, using negotiated format: {}",
                self.negotiated
            );
        }

        match classification.route {
            ResponseRoute::SaveMp3 => self.save(MP3_FILE, payload).await,
            ResponseRoute::PlayOpus => {
                let fallback = if classification.sniffed.is_some() {
                    UNDECODABLE_FILE
                } else {
                    OPUS_ERROR_FILE
                };
                self.play_opus(payload, fallback).await
            }
            ResponseRoute::Save { extension } => {
                self.save(&format!("response.{}", extension), payload).await
            }
        }
    }

    async fn play_opus(&mut self, payload: &[u8], fallback: &str) -> ChunkOutcome {
        let played = self
            .decoder
            .decode(payload)
            .and_then(|pcm| self.output.write(&pcm).map(|_| pcm.len()));

        match played {
            Ok(samples) => {
                info!("Playing decoded Opus audio: {} samples", samples);
                ChunkOutcome::Played { samples }
            }
            Err(e) => {
                error!("Error decoding Opus: {}", e);
                error!(
                    "Audio length: {} bytes, first bytes: {}",
                    payload.len(),
                    hex_prefix(payload, HEX_PREVIEW_BYTES)
                );
                match self.save(fallback, payload).await {
                    ChunkOutcome::Saved { path } => ChunkOutcome::DecodeFailed { path },
                    other => other,
                }
            }
        }
    }

    async fn save(&self, file_name: &str, payload: &[u8]) -> ChunkOutcome {
        let path = self.output_dir.join(file_name);
        match tokio::fs::write(&path, payload).await {
            Ok(()) => {
                info!("Saved audio to {}", path.display());
                ChunkOutcome::Saved { path }
            }
            Err(e) => {
                error!("Failed to save audio to {}: {}", path.display(), e);
                ChunkOutcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, Result};

    struct FakeDecoder {
        fail: bool,
    }

    impl FrameDecoder for FakeDecoder {
        fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
            if self.fail {
                return Err(ClientError::Audio("corrupted stream".into()));
            }
            Ok(packet.iter().map(|&b| i16::from(b)).collect())
        }
    }

    #[derive(Default)]
    struct FakeOutput {
        written: Vec<i16>,
    }

    impl PlaybackDevice for FakeOutput {
        fn write(&mut self, pcm: &[i16]) -> Result<()> {
            self.written.extend_from_slice(pcm);
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(sniff_format(b"ID3\x04\x00rest"), Some(AudioFormat::Mp3));
        assert_eq!(sniff_format(&[0xFF, 0xFB, 0x90, 0x00]), Some(AudioFormat::Mp3));
        assert_eq!(sniff_format(&[0xFF, 0xF3, 0x00]), Some(AudioFormat::Mp3));
        assert_eq!(sniff_format(b"OggS\x00\x02"), Some(AudioFormat::Opus));
        assert_eq!(sniff_format(&[0xFF, 0x1F, 0x00]), None);
        assert_eq!(sniff_format(&[0x78, 0x01, 0x02]), None);
        assert_eq!(sniff_format(&[]), None);
    }

    #[test]
    fn test_id3_is_mp3_regardless_of_negotiation() {
        for negotiated in ["opus", "mp3", "wav"] {
            let c = classify(b"ID3\x03\x00payload", negotiated);
            assert_eq!(c.route, ResponseRoute::SaveMp3);
        }
    }

    #[test]
    fn test_ogg_is_opus_regardless_of_negotiation() {
        for negotiated in ["opus", "mp3", "pcm"] {
            let c = classify(b"OggS\x00\x02rest", negotiated);
            assert_eq!(c.route, ResponseRoute::PlayOpus);
        }
    }

    #[test]
    fn test_mismatch_flag() {
        assert!(classify(b"ID3\x03", "opus").mismatch);
        assert!(!classify(b"ID3\x03", "MP3").mismatch);
        assert!(!classify(&[0x78, 0x01], "mp3").mismatch);
    }

    #[test]
    fn test_mismatch_warning_names_both_formats() {
        assert_eq!(
            classify(b"ID3\x03", "opus").mismatch_warning("opus").as_deref(),
            Some("Received mp3 audio, but session negotiated opus; using mp3")
        );
        assert_eq!(
            classify(b"OggS\x00", "mp3").mismatch_warning("mp3").as_deref(),
            Some("Received opus audio, but session negotiated mp3; using opus")
        );
        assert_eq!(classify(b"ID3\x03", "mp3").mismatch_warning("mp3"), None);
        assert_eq!(classify(&[0x78, 0x01], "opus").mismatch_warning("opus"), None);
    }

    #[test]
    fn test_indeterminate_falls_back_to_negotiated() {
        let packet = [0x78u8, 0x01, 0x02];
        assert_eq!(classify(&packet, "opus").route, ResponseRoute::PlayOpus);
        assert_eq!(classify(&packet, "mp3").route, ResponseRoute::SaveMp3);
        assert_eq!(
            classify(&packet, "wav").route,
            ResponseRoute::Save {
                extension: "wav".into()
            }
        );
    }

    #[test]
    fn test_extension_is_sanitized() {
        assert_eq!(file_extension("../../etc/passwd"), "etcpasswd");
        assert_eq!(file_extension("./"), "bin");
    }

    #[tokio::test]
    async fn test_id3_chunk_saved_as_mp3_when_opus_negotiated() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = FakeDecoder { fail: false };
        let mut output = FakeOutput::default();
        let payload = b"ID3\x04\x00\x00mp3-bytes".to_vec();

        let outcome = {
            let mut audio = ResponseAudio::new(&mut decoder, &mut output, dir.path(), "opus");
            audio.handle(&payload).await
        };

        let expected = dir.path().join(MP3_FILE);
        assert_eq!(outcome, ChunkOutcome::Saved { path: expected.clone() });
        assert_eq!(std::fs::read(expected).unwrap(), payload);
        assert!(output.written.is_empty());
    }

    #[tokio::test]
    async fn test_opus_chunk_is_played() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = FakeDecoder { fail: false };
        let mut output = FakeOutput::default();

        let outcome = {
            let mut audio = ResponseAudio::new(&mut decoder, &mut output, dir.path(), "opus");
            audio.handle(&[0x78, 0x01, 0x02]).await
        };

        assert_eq!(outcome, ChunkOutcome::Played { samples: 3 });
        assert_eq!(output.written, vec![0x78, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_decode_failure_is_saved_for_diagnosis() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = FakeDecoder { fail: true };
        let mut output = FakeOutput::default();

        let (sniffed, negotiated) = {
            let mut audio = ResponseAudio::new(&mut decoder, &mut output, dir.path(), "opus");
            (
                audio.handle(b"OggS\x00bad").await,
                audio.handle(&[0x78, 0x01]).await,
            )
        };

        assert_eq!(
            sniffed,
            ChunkOutcome::DecodeFailed {
                path: dir.path().join(UNDECODABLE_FILE)
            }
        );
        assert_eq!(
            negotiated,
            ChunkOutcome::DecodeFailed {
                path: dir.path().join(OPUS_ERROR_FILE)
            }
        );
        assert_eq!(
            std::fs::read(dir.path().join(OPUS_ERROR_FILE)).unwrap(),
            vec![0x78, 0x01]
        );
    }

    #[tokio::test]
    async fn test_unknown_negotiated_format_saved_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = FakeDecoder { fail: false };
        let mut output = FakeOutput::default();

        let outcome = {
            let mut audio = ResponseAudio::new(&mut decoder, &mut output, dir.path(), "WAV");
            audio.handle(b"RIFF....WAVE").await
        };

        assert_eq!(
            outcome,
            ChunkOutcome::Saved {
                path: dir.path().join("response.wav")
            }
        );
    }

    #[tokio::test]
    async fn test_write_error_is_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let mut decoder = FakeDecoder { fail: false };
        let mut output = FakeOutput::default();

        let mut audio = ResponseAudio::new(&mut decoder, &mut output, &missing, "mp3");
        assert_eq!(audio.handle(b"ID3\x03").await, ChunkOutcome::Dropped);
    }
}
