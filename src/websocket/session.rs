//! Состояние одной голосовой сессии

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::websocket::audio::ChunkOutcome;
use crate::websocket::protocol::ServerEvent;

/// Флаг остановки, общий для задач одной сессии
///
/// Задачи проверяют его в точках ожидания; `cancelled` позволяет
/// ждать его вместе с другим future в `select!`.
#[derive(Debug, Clone)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Завершается, как только флаг установлен (сразу, если уже)
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Предупреждение, которое выводится не чаще раза в `interval`
#[derive(Debug)]
pub struct RateLimitedWarning {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimitedWarning {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Что сервер вернул на hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    /// Формат аудио ответов, в нижнем регистре
    pub negotiated_format: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub captured: usize,
    pub sent: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveSummary {
    pub events: Vec<ServerEvent>,
    pub chunks: Vec<ChunkOutcome>,
}

/// Итог сессии
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: Option<String>,
    pub negotiated_format: String,
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub events: Vec<ServerEvent>,
    pub chunks: Vec<ChunkOutcome>,
    pub timed_out: bool,
    pub channel_closed: bool,
    pub output_released: bool,
}

impl SessionReport {
    pub fn new(
        info: SessionInfo,
        capture: CaptureReport,
        received: ReceiveSummary,
        timed_out: bool,
    ) -> Self {
        Self {
            session_id: info.session_id,
            negotiated_format: info.negotiated_format,
            frames_captured: capture.captured,
            frames_sent: capture.sent,
            events: received.events,
            chunks: received.chunks,
            timed_out,
            channel_closed: false,
            output_released: false,
        }
    }
}
