//! Конфигурация клиента
//!
//! Настройки загружаются из переменных окружения или .env файла,
//! а затем могут быть переопределены флагами командной строки.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::audio::OPUS_FRAME_SIZE_MS;

const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";
/// Дольше часа не пишем
pub const MAX_RECORD_SECONDS: u64 = 3600;

/// Главная структура конфигурации клиента
///
/// - server: куда подключаться
/// - session: параметры одной голосовой сессии
/// - security: ключ HMAC для активации устройства
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint консоли, например "ws://localhost:8080/ws"
    pub url: String,
}

/// Формат аудио для TTS ответов
///
/// Клиент может запросить только один из этих двух форматов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Opus - декодируем и сразу проигрываем
    #[serde(rename = "opus")]
    Opus,
    /// MP3 - декодера нет, сохраняем в файл
    #[serde(rename = "mp3")]
    Mp3,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Opus => "opus",
            AudioFormat::Mp3 => "mp3",
        }
    }

    /// Распознает имя формата без учета регистра
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "opus" => Some(AudioFormat::Opus),
            "mp3" => Some(AudioFormat::Mp3),
            _ => None,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unsupported audio format '{}', expected opus or mp3", s))
    }
}

/// Флаги возможностей, которые клиент объявляет в hello
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Acoustic Echo Cancellation
    pub aec: bool,
    /// Model Context Protocol
    pub mcp: bool,
}

/// Параметры одной голосовой сессии
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Формат, в котором просим сервер присылать аудио ответа
    pub audio_format: AudioFormat,
    /// Сколько секунд записываем с микрофона
    pub record_seconds: u64,
    /// Сколько ждем ответа сервера после отправки аудио
    pub response_timeout_secs: u64,
    /// Куда сохранять MP3 ответы и нераспознанные чанки
    pub output_dir: PathBuf,
    pub features: FeatureFlags,
}

impl SessionConfig {
    /// Количество 20 мс кадров за время записи (250 для 5 секунд)
    ///
    /// Длительность ограничена `MAX_RECORD_SECONDS`.
    pub fn frame_budget(&self) -> usize {
        let seconds = self.record_seconds.min(MAX_RECORD_SECONDS);
        let frames = seconds.saturating_mul(1000) / u64::from(OPUS_FRAME_SIZE_MS);
        usize::try_from(frames).unwrap_or(usize::MAX)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub hmac_key: String,
}

impl Config {
    /// Загружает конфигурацию из переменных окружения
    ///
    /// Сначала пробуем .env файл, потом берем дефолты и перезаписываем
    /// их тем, что нашли в окружении. Непарсящиеся значения пропускаем
    /// с предупреждением.
    pub fn load() -> anyhow::Result<Self> {
        match dotenv::dotenv() {
            Ok(path) => {
                tracing::info!("Loaded .env file from: {:?}", path);
            }
            Err(dotenv::Error::Io(_)) => {
                tracing::debug!(".env file not found, using environment variables");
            }
            Err(dotenv::Error::LineParse(problem_line, _err)) => {
                // Загружаем файл вручную, пропуская проблемную строку
                tracing::warn!("Failed to parse line in .env file: '{}' (will try to load other variables)", problem_line);
                if let Ok(content) = std::fs::read_to_string(".env") {
                    let loaded = apply_env_lines(&content, &problem_line);
                    tracing::info!("Loaded {} environment variables from .env file (skipped problematic lines)", loaded);
                }
            }
            Err(e) => {
                tracing::warn!("Failed to load .env file: {} (will use environment variables)", e);
            }
        }

        let mut cfg = Self::default();

        if let Ok(url) = std::env::var("ROBOT_SERVER_URL") {
            if !url.trim().is_empty() {
                cfg.server.url = url.trim().to_string();
            }
        }

        if let Ok(format) = std::env::var("ROBOT_AUDIO_FORMAT") {
            match format.parse::<AudioFormat>() {
                Ok(format) => cfg.session.audio_format = format,
                Err(e) => tracing::warn!("ROBOT_AUDIO_FORMAT ignored: {}", e),
            }
        }
        override_parsed("ROBOT_RECORD_SECONDS", &mut cfg.session.record_seconds);
        if cfg.session.record_seconds > MAX_RECORD_SECONDS {
            tracing::warn!(
                "ROBOT_RECORD_SECONDS={} is too long, recording {} seconds",
                cfg.session.record_seconds,
                MAX_RECORD_SECONDS
            );
        }
        override_parsed("ROBOT_RESPONSE_TIMEOUT_SECS", &mut cfg.session.response_timeout_secs);
        if let Ok(dir) = std::env::var("ROBOT_OUTPUT_DIR") {
            cfg.session.output_dir = PathBuf::from(dir);
        }
        override_parsed("ROBOT_FEATURE_AEC", &mut cfg.session.features.aec);
        override_parsed("ROBOT_FEATURE_MCP", &mut cfg.session.features.mcp);

        if let Ok(key) = std::env::var("HMAC_KEY") {
            cfg.security.hmac_key = key;
        }

        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: DEFAULT_SERVER_URL.to_string(),
            },
            session: SessionConfig {
                audio_format: AudioFormat::Mp3,
                record_seconds: 5,
                response_timeout_secs: 300,
                output_dir: PathBuf::from("."),
                features: FeatureFlags {
                    aec: true,
                    mcp: false,
                },
            },
            security: SecurityConfig {
                hmac_key: "change-me".to_string(),
            },
        }
    }
}

fn override_parsed<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("{}='{}' is not valid, keeping default", name, raw),
        }
    }
}

/// Применяет строки KEY=VALUE из .env, пропуская `skip`
fn apply_env_lines(content: &str, skip: &str) -> usize {
    let mut loaded = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line == skip {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() && !key.contains(' ') {
                std::env::set_var(key, value);
                loaded += 1;
            }
        }
    }
    loaded
}
