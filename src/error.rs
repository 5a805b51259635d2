//! Ошибки клиента

use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Микрофон или динамик недоступны
    #[error("audio device error: {0}")]
    Audio(String),

    #[error("opus codec error: {0}")]
    Codec(#[from] audiopus::Error),

    /// Сервер прислал то, что нельзя разобрать как JSON
    #[error("invalid message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("websocket connection closed {0}")]
    ConnectionClosed(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Сессию остановили до того, как она началась
    #[error("session interrupted")]
    Interrupted,
}

impl ClientError {
    /// Подсказка для ошибок, из-за которых сессию нельзя даже начать
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Audio(_) => Some(
                "Check that a microphone and speakers are connected and that this process \
                 may use them (ALSA/PulseAudio on Linux, microphone permission on macOS).",
            ),
            Self::Codec(_) => Some(
                "Opus codec is unavailable. Install libopus (brew install opus / \
                 apt install libopus-dev) and rebuild the client.",
            ),
            Self::Transport(_) | Self::ConnectionClosed(_) => Some(
                "Make sure the robot console server is running and ROBOT_SERVER_URL points to its /ws endpoint.",
            ),
            Self::Protocol(_) | Self::Io(_) | Self::Interrupted => None,
        }
    }

    /// Ошибка означает, что канал уже закрыт
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_)
                | Self::Transport(tungstenite::Error::ConnectionClosed)
                | Self::Transport(tungstenite::Error::AlreadyClosed)
        )
    }
}
