//! WebSocket протокол консоли (со стороны клиента)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{AudioFormat, FeatureFlags};
use crate::utils::audio::{CHANNEL_COUNT, OPUS_FRAME_SIZE_MS, SAMPLE_RATE_HZ};

pub const PROTOCOL_VERSION: u32 = 3;
pub const TRANSPORT: &str = "websocket";
const HELLO: &str = "hello";

/// Первое сообщение клиента
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub transport: String,
    pub features: Features,
    pub audio_params: AudioParams,
    /// Формат аудио ответов сервера (TTS)
    pub audio_format: AudioFormat,
}

impl HelloMessage {
    pub fn new(features: FeatureFlags, audio_format: AudioFormat) -> Self {
        Self {
            kind: HELLO.to_string(),
            version: PROTOCOL_VERSION,
            transport: TRANSPORT.to_string(),
            features: Features {
                aec: features.aec,
                mcp: features.mcp,
            },
            audio_params: AudioParams::opus_uplink(),
            audio_format,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub aec: bool,
    pub mcp: bool,
}

/// Параметры аудио, которое клиент отправляет на сервер
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_duration: u32,
}

impl AudioParams {
    /// Opus, 48 kHz, моно, 20 мс кадры
    pub fn opus_uplink() -> Self {
        Self {
            format: AudioFormat::Opus.as_str().to_string(),
            sample_rate: SAMPLE_RATE_HZ,
            channels: u32::from(CHANNEL_COUNT),
            frame_duration: OPUS_FRAME_SIZE_MS,
        }
    }
}

/// Ответ сервера на hello
///
/// Разбирается из произвольного JSON: поле не той формы считается
/// отсутствующим, а не ошибкой.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelloAck {
    /// Значение `type`; не строка сохраняется как JSON текст
    pub kind: Option<String>,
    pub session_id: Option<String>,
    pub audio_format: Option<String>,
}

impl HelloAck {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_slice(raw)?;
        let kind = payload.get("type").map(|kind| match kind.as_str() {
            Some(kind) => kind.to_owned(),
            None => kind.to_string(),
        });

        Ok(Self {
            kind,
            session_id: optional_string(&payload, "session_id"),
            audio_format: optional_string(&payload, "audio_format"),
        })
    }

    pub fn is_hello(&self) -> bool {
        self.kind.as_deref() == Some(HELLO)
    }

    /// Формат, в котором сервер будет слать аудио
    ///
    /// Если сервер не вернул audio_format, считаем, что он принял наш.
    pub fn negotiated_format(&self, requested: AudioFormat) -> String {
        self.audio_format
            .as_ref()
            .map(|format| format.trim().to_ascii_lowercase())
            .filter(|format| !format.is_empty())
            .unwrap_or_else(|| requested.as_str().to_string())
    }
}

/// Текстовое сообщение от сервера после рукопожатия
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Распознанная речь (stt)
    Transcription { text: String },
    /// Ответ языковой модели (llm)
    Response { text: String },
    /// Повторный hello
    Hello { payload: Value },
    /// Системное уведомление
    System { command: String },
    Unknown { kind: Option<String>, payload: Value },
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_str(text)?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let event = match kind.as_deref() {
            Some("stt") => ServerEvent::Transcription {
                text: string_field(&payload, "text"),
            },
            Some("llm") => ServerEvent::Response {
                text: string_field(&payload, "text"),
            },
            Some("hello") => ServerEvent::Hello { payload },
            Some("system") => ServerEvent::System {
                command: string_field(&payload, "command"),
            },
            other => ServerEvent::Unknown {
                kind: other.map(str::to_owned),
                payload,
            },
        };
        Ok(event)
    }

    /// Выводит событие в лог
    pub fn render(&self) {
        match self {
            ServerEvent::Transcription { text } => info!("Transcription (STT): {}", text),
            ServerEvent::Response { text } => info!("LLM Response: {}", text),
            ServerEvent::Hello { payload } => info!("Received Hello again: {}", payload),
            ServerEvent::System { command } => info!("System message: {}", command),
            ServerEvent::Unknown { kind, payload } => {
                info!("Unknown message type: {:?}, full message: {}", kind, payload)
            }
        }
    }
}

fn optional_string(payload: &Value, name: &str) -> Option<String> {
    payload.get(name).and_then(Value::as_str).map(str::to_owned)
}

fn string_field(payload: &Value, name: &str) -> String {
    payload
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn features() -> FeatureFlags {
        FeatureFlags {
            aec: true,
            mcp: false,
        }
    }

    #[test]
    fn test_hello_wire_format() {
        let hello = HelloMessage::new(features(), AudioFormat::Mp3);
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "hello",
                "version": 3,
                "transport": "websocket",
                "features": {"aec": true, "mcp": false},
                "audio_params": {
                    "format": "opus",
                    "sample_rate": 48000,
                    "channels": 1,
                    "frame_duration": 20
                },
                "audio_format": "mp3"
            })
        );
    }

    #[test]
    fn test_ack_without_audio_format_falls_back_to_requested() {
        let ack = HelloAck::parse(br#"{"type":"hello","session_id":"abc"}"#).unwrap();
        assert!(ack.is_hello());
        assert_eq!(ack.session_id.as_deref(), Some("abc"));
        assert_eq!(ack.negotiated_format(AudioFormat::Opus), "opus");
        assert_eq!(ack.negotiated_format(AudioFormat::Mp3), "mp3");
    }

    #[test]
    fn test_ack_audio_format_wins() {
        let ack = HelloAck::parse(br#"{"type":"hello","session_id":"abc","audio_format":"MP3"}"#)
            .unwrap();
        assert_eq!(ack.negotiated_format(AudioFormat::Opus), "mp3");
    }

    #[test]
    fn test_ack_with_other_type() {
        let ack = HelloAck::parse(br#"{"type":"system","command":"busy"}"#).unwrap();
        assert!(!ack.is_hello());
        assert_eq!(ack.session_id, None);
    }

    #[test]
    fn test_ack_with_numeric_type_is_not_hello() {
        let ack = HelloAck::parse(br#"{"type":3,"session_id":"s"}"#).unwrap();
        assert!(!ack.is_hello());
        assert_eq!(ack.kind.as_deref(), Some("3"));
        assert_eq!(ack.session_id.as_deref(), Some("s"));
    }

    #[test]
    fn test_ack_ignores_non_string_fields() {
        let ack = HelloAck::parse(br#"{"type":"hello","session_id":42,"audio_format":1}"#).unwrap();
        assert!(ack.is_hello());
        assert_eq!(ack.session_id, None);
        assert_eq!(ack.negotiated_format(AudioFormat::Opus), "opus");
    }

    #[test]
    fn test_ack_not_an_object() {
        let ack = HelloAck::parse(b"[1, 2]").unwrap();
        assert!(!ack.is_hello());
        assert_eq!(ack, HelloAck::default());
    }

    #[test]
    fn test_ack_not_json() {
        assert!(HelloAck::parse(b"not json").is_err());
    }

    #[test]
    fn test_parse_stt() {
        let event = ServerEvent::parse(r#"{"type":"stt","text":"hello"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::Transcription {
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_llm_and_system() {
        let llm = ServerEvent::parse(r#"{"type":"llm","session_id":"s","text":"Hi!"}"#).unwrap();
        assert_eq!(llm, ServerEvent::Response { text: "Hi!".into() });

        let system = ServerEvent::parse(r#"{"type":"system","command":"error: boom"}"#).unwrap();
        assert_eq!(
            system,
            ServerEvent::System {
                command: "error: boom".into()
            }
        );
    }

    #[test]
    fn test_parse_late_hello() {
        let event = ServerEvent::parse(r#"{"type":"hello","session_id":"x"}"#).unwrap();
        assert!(matches!(event, ServerEvent::Hello { .. }));
    }

    #[test]
    fn test_parse_unknown_keeps_payload() {
        let event = ServerEvent::parse(r#"{"type":"tts","state":"start"}"#).unwrap();
        match event {
            ServerEvent::Unknown { kind, payload } => {
                assert_eq!(kind.as_deref(), Some("tts"));
                assert_eq!(payload["state"], "start");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let untyped = ServerEvent::parse(r#"{"text":"no type"}"#).unwrap();
        assert!(matches!(untyped, ServerEvent::Unknown { kind: None, .. }));
    }

    #[test]
    fn test_missing_text_is_empty() {
        let event = ServerEvent::parse(r#"{"type":"stt"}"#).unwrap();
        assert_eq!(event, ServerEvent::Transcription { text: String::new() });
    }
}
