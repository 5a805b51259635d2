//! Голосовая сессия с консолью через WebSocket
//!
//! Сессия проходит четыре фазы:
//! 1. hello и ответ сервера с session_id и форматом аудио ответов
//! 2. запись с микрофона и отправка Opus кадров
//! 3. параллельно - прием текстовых событий и аудио ответов
//! 4. закрытие канала и освобождение устройств
//!
//! Обе задачи крутятся в одном async контексте через `select!`, без spawn.

pub mod audio;
pub mod protocol;
pub mod session;

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SessionConfig;
use crate::devices::{CaptureDevice, MicrophoneCapture, PlaybackDevice, SpeakerPlayback};
use crate::error::{ClientError, Result};
use crate::utils::audio::{
    FrameDecoder, FrameEncoder, OpusFrameDecoder, OpusFrameEncoder, OPUS_FRAME_SIZE_MS,
};
use crate::websocket::audio::ResponseAudio;
use crate::websocket::protocol::{HelloAck, HelloMessage, ServerEvent};
use crate::websocket::session::{
    CaptureReport, RateLimitedWarning, ReceiveSummary, SessionInfo, SessionReport, StopFlag,
};

const OVERFLOW_WARNING_INTERVAL: Duration = Duration::from_secs(5);

pub type ConsoleSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(url: &str) -> Result<ConsoleSocket> {
    info!("Connecting to {}", url);
    let (socket, response) = connect_async(url).await?;
    debug!("WebSocket handshake status: {}", response.status());
    Ok(socket)
}

/// Открывает устройства, подключается и проводит одну сессию
///
/// Устройства и кодек создаются до подключения: если их нет,
/// к серверу даже не ходим. `stop` завершает сессию штатно, с закрытием
/// канала и освобождением устройств.
pub async fn run_session(url: &str, config: SessionConfig, stop: StopFlag) -> Result<SessionReport> {
    let session = VoiceSession::with_default_devices(config)?.with_stop_flag(stop.clone());
    let socket = tokio::select! {
        socket = connect(url) => socket?,
        _ = stop.cancelled() => return Err(ClientError::Interrupted),
    };
    session.run(socket).await
}

pub struct VoiceSession {
    config: SessionConfig,
    capture: Box<dyn CaptureDevice>,
    playback: Box<dyn PlaybackDevice>,
    encoder: Box<dyn FrameEncoder>,
    decoder: Box<dyn FrameDecoder>,
    stop: StopFlag,
}

impl VoiceSession {
    pub fn new(
        config: SessionConfig,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
        encoder: Box<dyn FrameEncoder>,
        decoder: Box<dyn FrameDecoder>,
    ) -> Self {
        Self {
            config,
            capture,
            playback,
            encoder,
            decoder,
            stop: StopFlag::new(),
        }
    }

    /// Использовать внешний флаг остановки (например, по Ctrl-C)
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_default_devices(config: SessionConfig) -> Result<Self> {
        let encoder = OpusFrameEncoder::new()?;
        let decoder = OpusFrameDecoder::new()?;
        let capture = MicrophoneCapture::new()?;
        let playback = SpeakerPlayback::open()?;
        Ok(Self::new(
            config,
            Box::new(capture),
            Box::new(playback),
            Box::new(encoder),
            Box::new(decoder),
        ))
    }

    /// Проводит сессию на уже открытом канале
    ///
    /// Канал закрывается, а устройство вывода освобождается при любом исходе.
    #[instrument(skip_all, fields(audio_format = %self.config.audio_format))]
    pub async fn run<T>(mut self, channel: T) -> Result<SessionReport>
    where
        T: Sink<WsMessage, Error = WsError>
            + Stream<Item = std::result::Result<WsMessage, WsError>>
            + Unpin,
    {
        let (mut sink, mut stream) = channel.split();

        let stop = self.stop.clone();
        let info = match handshake(&mut sink, &mut stream, &self.config, &stop).await {
            Ok(info) => info,
            Err(e) => {
                error!("Handshake failed: {}", e);
                if let Err(close_err) = sink.close().await {
                    warn!("Failed to close WebSocket: {}", close_err);
                }
                if let Err(stop_err) = self.playback.stop() {
                    warn!("Failed to stop audio output: {}", stop_err);
                }
                return Err(e);
            }
        };

        let response_timeout = self.config.response_timeout();

        let (capture, received, timed_out, channel_closed) = {
            let mut responder = ResponseAudio::new(
                self.decoder.as_mut(),
                self.playback.as_mut(),
                &self.config.output_dir,
                &info.negotiated_format,
            );
            let recv = receive_and_render(&mut stream, &mut responder, &stop);
            tokio::pin!(recv);
            let mut received: Option<ReceiveSummary> = None;

            let capture = {
                let send = capture_and_send(
                    &mut sink,
                    self.capture.as_mut(),
                    self.encoder.as_mut(),
                    &stop,
                    self.config.frame_budget(),
                );
                tokio::pin!(send);
                loop {
                    tokio::select! {
                        report = &mut send => break report,
                        summary = &mut recv, if received.is_none() => {
                            received = Some(summary);
                        }
                    }
                }
            };

            let mut timed_out = false;
            if received.is_none() {
                match tokio::time::timeout(response_timeout, &mut recv).await {
                    Ok(summary) => received = Some(summary),
                    Err(_) => {
                        warn!("No response within {:?}, closing connection", response_timeout);
                        timed_out = true;
                    }
                }
            }

            // Каждый шаг выполняется, даже если предыдущий упал
            stop.set();
            let channel_closed = match sink.close().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to close WebSocket: {}", e);
                    false
                }
            };
            let received = match received {
                Some(summary) => summary,
                None => recv.await,
            };

            (capture, received, timed_out, channel_closed)
        };

        let output_released = match self.playback.stop() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to stop audio output: {}", e);
                false
            }
        };

        let mut report = SessionReport::new(info, capture, received, timed_out);
        report.channel_closed = channel_closed;
        report.output_released = output_released;

        info!(
            frames_sent = report.frames_sent,
            events = report.events.len(),
            chunks = report.chunks.len(),
            "Connection closed"
        );
        Ok(report)
    }
}

/// Отправляет hello и ждет ровно один ответ
async fn handshake<S, R>(
    sink: &mut S,
    stream: &mut R,
    config: &SessionConfig,
    stop: &StopFlag,
) -> Result<SessionInfo>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    if stop.is_set() {
        return Err(ClientError::Interrupted);
    }
    let hello = HelloMessage::new(config.features, config.audio_format);
    sink.send(WsMessage::Text(serde_json::to_string(&hello)?))
        .await?;
    info!("Sent Hello message with audio_format: {}", hello.audio_format);

    let reply = loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Err(ClientError::Interrupted),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => break text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => break data,
            Some(Ok(WsMessage::Close(frame))) => {
                warn!("Server closed connection before hello response: {:?}", frame);
                return Err(ClientError::ConnectionClosed("before hello response"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::ConnectionClosed("before hello response")),
        }
    };

    let ack = HelloAck::parse(&reply)?;
    if !ack.is_hello() {
        warn!("Unexpected response type: {:?}", ack.kind);
    }

    let info = SessionInfo {
        session_id: ack.session_id.clone(),
        negotiated_format: ack.negotiated_format(config.audio_format),
    };
    info!("Session ID: {}", info.session_id.as_deref().unwrap_or("<none>"));
    info!("Server will send audio in format: {}", info.negotiated_format);
    Ok(info)
}

/// Записывает `frame_budget` кадров, затем кодирует и отправляет их по порядку
async fn capture_and_send<S>(
    sink: &mut S,
    capture: &mut dyn CaptureDevice,
    encoder: &mut dyn FrameEncoder,
    stop: &StopFlag,
    frame_budget: usize,
) -> CaptureReport
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut report = CaptureReport::default();

    if let Err(e) = capture.start() {
        error!("Failed to start audio capture: {}", e);
        stop.set();
        return report;
    }

    let mut overflow_warning = RateLimitedWarning::new(OVERFLOW_WARNING_INTERVAL);
    let mut frames: Vec<Vec<i16>> = Vec::new();
    while !stop.is_set() && frames.len() < frame_budget {
        match capture.read_frame() {
            Ok(frame) => {
                if frame.overflowed && overflow_warning.should_emit(Instant::now()) {
                    warn!("Audio input overflowed - some audio may be lost");
                }
                frames.push(frame.samples);
            }
            Err(e) => {
                error!("Capture error: {}", e);
                stop.set();
            }
        }
        // Даем поработать приему сообщений
        tokio::task::yield_now().await;
    }
    capture.stop();
    report.captured = frames.len();

    if !frames.is_empty() {
        info!(
            "Sending {} frames (~{} ms of audio)",
            frames.len(),
            frames.len() * OPUS_FRAME_SIZE_MS as usize
        );
    }

    for pcm in frames {
        if stop.is_set() {
            break;
        }
        let packet = match encoder.encode(&pcm) {
            Ok(packet) => packet,
            Err(e) => {
                error!("Send audio error: {}", e);
                stop.set();
                break;
            }
        };
        if let Err(e) = sink.send(WsMessage::Binary(packet)).await {
            let e = ClientError::from(e);
            if e.is_closed() {
                error!("WebSocket connection closed during sending");
            } else {
                error!("Send audio error: {}", e);
            }
            stop.set();
            break;
        }
        report.sent += 1;
    }

    info!("Finished sending audio: {} of {} frames", report.sent, report.captured);
    report
}

/// Принимает сообщения сервера, пока не установлен флаг остановки
async fn receive_and_render<R>(
    stream: &mut R,
    responder: &mut ResponseAudio<'_>,
    stop: &StopFlag,
) -> ReceiveSummary
where
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let mut summary = ReceiveSummary::default();

    while !stop.is_set() {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => match ServerEvent::parse(&text) {
                Ok(event) => {
                    event.render();
                    summary.events.push(event);
                }
                Err(e) => warn!("Failed to parse server message: {} ({})", e, text),
            },
            Some(Ok(WsMessage::Binary(data))) => {
                let outcome = responder.handle(&data).await;
                summary.chunks.push(outcome);
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!("Server closed connection: {:?}", frame);
                stop.set();
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let e = ClientError::from(e);
                if e.is_closed() {
                    error!("WebSocket connection closed during receive");
                } else {
                    error!("Receive error: {}", e);
                }
                stop.set();
            }
            None => {
                error!("WebSocket connection closed during receive");
                stop.set();
            }
        }
    }

    summary
}
