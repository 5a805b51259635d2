//! Аудио утилиты: Opus кодек и преобразования PCM

use audiopus::{coder::Decoder, coder::Encoder, Application, Channels, SampleRate};

use crate::error::Result;

/// Параметры аудио для Opus
pub const OPUS_SAMPLE_RATE: SampleRate = SampleRate::Hz48000;
pub const OPUS_CHANNELS: Channels = Channels::Mono;
pub const SAMPLE_RATE_HZ: u32 = 48_000;
pub const CHANNEL_COUNT: u16 = 1;
pub const OPUS_FRAME_SIZE_MS: u32 = 20; // 20ms frames
pub const OPUS_FRAME_SIZE: usize = (SAMPLE_RATE_HZ as usize * OPUS_FRAME_SIZE_MS as usize) / 1000; // 960 samples

/// Максимальный размер Opus пакета
const MAX_PACKET_SIZE: usize = 4000;

/// Кодирует один PCM кадр
pub trait FrameEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

/// Декодирует один пакет в PCM
pub trait FrameDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>>;
}

/// Opus энкодер для 20 мс моно кадров 48 kHz
pub struct OpusFrameEncoder {
    encoder: Encoder,
}

impl OpusFrameEncoder {
    pub fn new() -> Result<Self> {
        let encoder = Encoder::new(OPUS_SAMPLE_RATE, OPUS_CHANNELS, Application::Audio)?;
        Ok(Self { encoder })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        // Дополняем неполный кадр нулями
        let mut frame = vec![0i16; OPUS_FRAME_SIZE];
        let copy_len = pcm.len().min(OPUS_FRAME_SIZE);
        frame[..copy_len].copy_from_slice(&pcm[..copy_len]);

        let mut output = vec![0u8; MAX_PACKET_SIZE];
        let encoded_len = self.encoder.encode(&frame, &mut output)?;
        output.truncate(encoded_len);
        Ok(output)
    }
}

pub struct OpusFrameDecoder {
    decoder: Decoder,
}

impl OpusFrameDecoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new(OPUS_SAMPLE_RATE, OPUS_CHANNELS)?;
        Ok(Self { decoder })
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut buffer = vec![0i16; OPUS_FRAME_SIZE];
        let decoded_len = self.decoder.decode(Some(packet.try_into()?), (&mut buffer).try_into()?, false)?;
        buffer.truncate(decoded_len);
        Ok(buffer)
    }
}

/// f32 сэмплы cpal (-1.0..1.0) в i16
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Hex первых байт чанка для диагностики
pub fn hex_prefix(data: &[u8], len: usize) -> String {
    hex::encode(&data[..data.len().min(len)])
}
