// Транспорт push-канала
// WebSocket реализация поверх tokio-tungstenite и in-memory реализация для тестов

use crate::protocol::messages::{ClientEvent, ServerEvent};
use crate::protocol::wire::{pack_client_event, pack_server_event, unpack_server_event};
use crate::utils::error::{ChatError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Параметры аутентифицированного подключения
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub url: String,
    pub token: String,
}

/// Входящее событие уровня канала
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Event(ServerEvent),
    /// Liveness ping сервера, требует немедленного pong
    Ping(Vec<u8>),
}

/// Исходящий фрейм
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Event(ClientEvent),
    Pong(Vec<u8>),
}

/// Фабрика подключений push-канала
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn open(&self, handshake: &Handshake) -> Result<Box<dyn PushLink>>;
}

/// Одно открытое подключение
#[async_trait]
pub trait PushLink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()>;

    /// `None` - соединение закрыто сервером, `Some(Err)` - сбой транспорта
    async fn next_event(&mut self) -> Option<Result<LinkEvent>>;

    async fn close(&mut self);
}

// ============================================================================
// WebSocket
// ============================================================================

/// WebSocket транспорт.
///
/// Токен передаётся дважды: query-параметром `token` (handshake credential)
/// и заголовком `Authorization: Bearer`.
#[derive(Debug, Default, Clone)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn open(&self, handshake: &Handshake) -> Result<Box<dyn PushLink>> {
        let mut url = reqwest::Url::parse(&handshake.url)
            .map_err(|e| ChatError::ConnectionError(format!("Invalid push URL: {}", e)))?;
        url.query_pairs_mut().append_pair("token", &handshake.token);

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", handshake.token))
            .map_err(|e| ChatError::ConnectionError(format!("Invalid token header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!("Push channel handshake completed: {}", response.status());

        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WsLink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        let message = match frame {
            OutboundFrame::Event(event) => WsMessage::Text(pack_client_event(&event)?.into()),
            OutboundFrame::Pong(payload) => WsMessage::Pong(payload.into()),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Result<LinkEvent>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => match unpack_server_event(text.as_str()) {
                    Ok(event) => return Some(Ok(LinkEvent::Event(event))),
                    // Неизвестные события не рвут соединение
                    Err(e) => warn!("Skipping push frame: {}", e),
                },
                Ok(WsMessage::Ping(payload)) => return Some(Ok(LinkEvent::Ping(payload.to_vec()))),
                Ok(WsMessage::Close(frame)) => {
                    debug!("Push channel closed by server: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Push channel close failed: {}", e);
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Что сервер-заглушка может сделать с клиентским соединением
#[derive(Debug)]
enum PeerInput {
    /// JSON фрейм, как на проводе
    Frame(String),
    Ping(Vec<u8>),
    Fail(String),
}

#[derive(Debug, Default)]
struct MemoryTransportState {
    handshakes: Vec<Handshake>,
    failures_remaining: u32,
    fail_always: bool,
}

/// In-memory транспорт для тестов и офлайн-инструментов.
///
/// Каждое успешное `open` отдаёт серверную сторону как `MemoryPeer`
/// через `MemoryServer::accept`.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryTransportState>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Серверная сторона in-memory транспорта
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::new(Mutex::new(MemoryTransportState::default())),
            peers: peers_tx,
        };
        (transport, MemoryServer { peers: peers_rx })
    }

    /// Следующие `count` попыток подключения завершатся ошибкой
    pub fn fail_next(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Все попытки подключения завершаются ошибкой
    pub fn fail_always(&self, fail: bool) {
        self.lock().fail_always = fail;
    }

    /// Количество попыток `open`
    pub fn attempts(&self) -> usize {
        self.lock().handshakes.len()
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.lock().handshakes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTransportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PushTransport for MemoryTransport {
    async fn open(&self, handshake: &Handshake) -> Result<Box<dyn PushLink>> {
        {
            let mut state = self.lock();
            state.handshakes.push(handshake.clone());
            if state.fail_always {
                return Err(ChatError::ConnectionError("connection refused".to_string()));
            }
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(ChatError::ConnectionError("connection refused".to_string()));
            }
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            handshake: handshake.clone(),
            to_client,
            from_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| ChatError::ConnectionError("memory server dropped".to_string()))?;

        Ok(Box::new(MemoryLink {
            inbound: from_server,
            outbound: to_server,
        }))
    }
}

impl MemoryServer {
    /// Дождаться следующего подключения клиента
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Серверный конец одного in-memory подключения.
///
/// Drop закрывает соединение для клиента.
pub struct MemoryPeer {
    pub handshake: Handshake,
    to_client: mpsc::UnboundedSender<PeerInput>,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl MemoryPeer {
    pub fn push(&self, event: ServerEvent) {
        match pack_server_event(&event) {
            Ok(frame) => self.push_raw(&frame),
            Err(e) => warn!("Memory peer failed to pack event: {}", e),
        }
    }

    /// Отправить произвольный текстовый фрейм
    pub fn push_raw(&self, frame: &str) {
        let _ = self.to_client.send(PeerInput::Frame(frame.to_string()));
    }

    pub fn ping(&self, payload: Vec<u8>) {
        let _ = self.to_client.send(PeerInput::Ping(payload));
    }

    /// Оборвать соединение транспортной ошибкой
    pub fn fail(&self, reason: &str) {
        let _ = self.to_client.send(PeerInput::Fail(reason.to_string()));
    }

    /// Следующий фрейм от клиента; `None`, если клиент закрыл соединение
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.try_recv().ok()
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<PeerInput>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

#[async_trait]
impl PushLink for MemoryLink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| ChatError::ConnectionError("peer closed".to_string()))
    }

    async fn next_event(&mut self) -> Option<Result<LinkEvent>> {
        while let Some(input) = self.inbound.recv().await {
            match input {
                PeerInput::Frame(frame) => match unpack_server_event(&frame) {
                    Ok(event) => return Some(Ok(LinkEvent::Event(event))),
                    Err(e) => warn!("Skipping push frame: {}", e),
                },
                PeerInput::Ping(payload) => return Some(Ok(LinkEvent::Ping(payload))),
                PeerInput::Fail(reason) => return Some(Err(ChatError::ConnectionError(reason))),
            }
        }
        None
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::TypingData;

    fn handshake() -> Handshake {
        Handshake {
            url: "ws://chat.test/ws".into(),
            token: "tok".into(),
        }
    }

    #[tokio::test]
    async fn test_memory_link_round_trip() {
        let (transport, mut server) = MemoryTransport::new();
        let mut link = transport.open(&handshake()).await.unwrap();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.handshake.token, "tok");

        let typing = TypingData {
            conversation_id: "c1".into(),
            user_id: "u2".into(),
            recipient_id: None,
        };
        peer.push(ServerEvent::Typing(typing.clone()));
        assert_eq!(
            link.next_event().await.unwrap().unwrap(),
            LinkEvent::Event(ServerEvent::Typing(typing))
        );

        link.send(OutboundFrame::Pong(vec![7])).await.unwrap();
        assert_eq!(peer.recv().await, Some(OutboundFrame::Pong(vec![7])));

        drop(peer);
        assert!(link.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_unparsable_frames_are_skipped() {
        let (transport, mut server) = MemoryTransport::new();
        let mut link = transport.open(&handshake()).await.unwrap();
        let peer = server.accept().await.unwrap();

        peer.push_raw("not json");
        peer.push_raw(r#"{"event":"user_banned","data":{}}"#);
        peer.push_raw(r#"{"event":"stop_typing","data":{"conversationId":"c1","userId":"u2"}}"#);

        assert!(matches!(
            link.next_event().await,
            Some(Ok(LinkEvent::Event(ServerEvent::StopTyping(_))))
        ));
    }

    #[tokio::test]
    async fn test_memory_transport_scripted_failures() {
        let (transport, _server) = MemoryTransport::new();
        transport.fail_next(2);

        assert!(transport.open(&handshake()).await.is_err());
        assert!(transport.open(&handshake()).await.is_err());
        assert!(transport.open(&handshake()).await.is_ok());
        assert_eq!(transport.attempts(), 3);
    }
}
