// Управление подключением к push-каналу
//
// Менеджер владеет ровно одним подключением на сессию. Остальные
// компоненты получают `ConnectionHandle` или невладеющий `ChannelRef`.

use crate::config::Config;
use crate::protocol::messages::{ClientEvent, ServerEvent};
use crate::protocol::transport::{Handshake, LinkEvent, OutboundFrame, PushLink, PushTransport};
use crate::state::session::Session;
use crate::utils::error::Result;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Статус соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Состояние соединения, изменяется только менеджером
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Сигналы жизненного цикла (носят информационный характер)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { detail: String },
}

/// Состояние автоматического переподключения
#[derive(Debug, Clone)]
pub struct ReconnectState {
    /// Количество выполненных повторных попыток подряд
    attempts: u32,
    /// Максимальное количество повторных попыток
    max_attempts: u32,
    /// Текущая задержка в миллисекундах
    current_delay_ms: u64,
    /// Начальная задержка в миллисекундах
    initial_delay_ms: u64,
    /// Максимальная задержка в миллисекундах
    max_delay_ms: u64,
    /// Множитель задержки (1 = фиксированная)
    multiplier: u64,
}

impl ReconnectState {
    pub fn from_config(config: &Config) -> Self {
        let initial_delay = config.reconnect_delay_ms.min(config.reconnect_delay_max_ms);
        Self {
            attempts: 0,
            max_attempts: config.reconnect_max_attempts,
            current_delay_ms: initial_delay,
            initial_delay_ms: initial_delay,
            max_delay_ms: config.reconnect_delay_max_ms,
            multiplier: config.reconnect_backoff_multiplier.max(1),
        }
    }

    /// Вернуть задержку перед следующей попыткой и засчитать попытку
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay_ms;

        self.current_delay_ms = self
            .current_delay_ms
            .saturating_mul(self.multiplier)
            .min(self.max_delay_ms);
        self.attempts += 1;

        Duration::from_millis(delay)
    }

    /// Сбросить счётчик попыток (после успешного подключения)
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay_ms = self.initial_delay_ms;
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Получатель исходящих событий push-канала.
///
/// Возвращает `false`, если событие не было поставлено в очередь
/// (нет активного соединения). Отправка всегда best-effort.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClientEvent) -> bool;
}

enum ConnCmd {
    Emit(ClientEvent),
    Shutdown,
}

/// Дескриптор одного подключения
#[derive(Clone)]
pub struct ConnectionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<ConnCmd>,
    events: broadcast::Sender<ServerEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Порядковый номер подключения внутри менеджера
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Подписаться на входящие события (в порядке получения из канала)
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Фоновая задача подключения завершилась (teardown или исчерпаны попытки)
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn shutdown(&self) {
        let _ = self.commands.send(ConnCmd::Shutdown);
    }
}

impl EventSink for ConnectionHandle {
    fn emit(&self, event: ClientEvent) -> bool {
        self.commands.send(ConnCmd::Emit(event)).is_ok()
    }
}

type Slot = RwLock<Option<ConnectionHandle>>;

/// Невладеющая ссылка на текущее подключение менеджера
#[derive(Clone)]
pub struct ChannelRef {
    slot: Weak<Slot>,
}

impl ChannelRef {
    pub fn active(&self) -> Option<ConnectionHandle> {
        let slot = self.slot.upgrade()?;
        let guard = slot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }
}

impl EventSink for ChannelRef {
    fn emit(&self, event: ClientEvent) -> bool {
        match self.active() {
            Some(handle) => handle.emit(event),
            None => {
                debug!("No active push connection, dropping outbound event");
                false
            }
        }
    }
}

/// Менеджер подключения к push-каналу
pub struct ConnectionManager<T: PushTransport> {
    transport: Arc<T>,
    config: Config,
    slot: Arc<Slot>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl<T: PushTransport> ConnectionManager<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            slot: Arc::new(RwLock::new(None)),
            task: None,
            generation: 0,
        }
    }

    /// Открыть аутентифицированное подключение для сессии.
    ///
    /// Существующее подключение (той же или другой сессии) сначала
    /// закрывается; два подключения одновременно не существуют.
    pub async fn connect(&mut self, session: &Session) -> Result<ConnectionHandle> {
        let token = session.require_token()?.to_string();

        self.disconnect().await;

        self.generation += 1;
        let handshake = Handshake {
            url: self.config.push_url.clone(),
            token,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(self.config.event_channel_capacity.max(1));
        let (lifecycle_tx, _) = broadcast::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState {
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
        });

        let handle = ConnectionHandle {
            generation: self.generation,
            commands: commands_tx,
            events: events_tx.clone(),
            lifecycle: lifecycle_tx.clone(),
            state: state_rx,
        };

        info!(
            "Opening push channel for user {} (generation {})",
            session.user_id, self.generation
        );

        let worker = ConnectionWorker {
            transport: self.transport.clone(),
            handshake,
            reconnect: ReconnectState::from_config(&self.config),
            commands: commands_rx,
            events: events_tx,
            lifecycle: lifecycle_tx,
            state: state_tx,
        };
        self.task = Some(tokio::spawn(worker.run()));
        *self.write_slot() = Some(handle.clone());

        Ok(handle)
    }

    /// Закрыть текущее подключение и дождаться завершения фоновой задачи
    pub async fn disconnect(&mut self) {
        let previous = self.write_slot().take();
        if let Some(handle) = previous {
            debug!("Tearing down push channel generation {}", handle.generation);
            handle.shutdown();
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Push channel task ended abnormally: {}", e);
            }
        }
    }

    pub fn get_active(&self) -> Option<ConnectionHandle> {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Невладеющая ссылка для подписчиков
    pub fn channel(&self) -> ChannelRef {
        ChannelRef {
            slot: Arc::downgrade(&self.slot),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.get_active()
            .map(|handle| handle.state())
            .unwrap_or_default()
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<ConnectionHandle>> {
        self.slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: PushTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum LinkExit {
    Shutdown,
    Lost(String),
}

/// Фоновая задача: подключение, чтение событий, ограниченный reconnect
struct ConnectionWorker<T: PushTransport> {
    transport: Arc<T>,
    handshake: Handshake,
    reconnect: ReconnectState,
    commands: mpsc::UnboundedReceiver<ConnCmd>,
    events: broadcast::Sender<ServerEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<T: PushTransport> ConnectionWorker<T> {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionStatus::Connecting);

            match self.transport.open(&self.handshake).await {
                Ok(mut link) => {
                    self.reconnect.reset();
                    self.set_state(ConnectionStatus::Connected);
                    let _ = self.lifecycle.send(LifecycleEvent::Connected);
                    info!("Push channel connected");

                    match self.drive(link.as_mut()).await {
                        LinkExit::Shutdown => {
                            link.close().await;
                            self.finish_teardown();
                            return;
                        }
                        LinkExit::Lost(reason) => {
                            warn!("Push channel lost: {}", reason);
                            let _ = self.lifecycle.send(LifecycleEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => {
                    warn!("Push channel connect error: {}", e);
                    let _ = self.lifecycle.send(LifecycleEvent::ConnectError {
                        detail: e.to_string(),
                    });
                }
            }

            if !self.reconnect.can_retry() {
                info!(
                    "Giving up on push channel after {} reconnect attempts",
                    self.reconnect.attempts()
                );
                self.set_state(ConnectionStatus::Disconnected);
                return;
            }

            let delay = self.reconnect.next_delay();
            self.set_state(ConnectionStatus::Disconnected);
            debug!(
                "Reconnect attempt {} in {:?}",
                self.reconnect.attempts(),
                delay
            );

            if !self.wait_backoff(delay).await {
                self.finish_teardown();
                return;
            }
        }
    }

    /// Обслуживать открытое подключение до обрыва или teardown
    async fn drive(&mut self, link: &mut dyn PushLink) -> LinkExit {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ConnCmd::Emit(event)) => {
                        if let Err(e) = link.send(OutboundFrame::Event(event)).await {
                            return LinkExit::Lost(e.to_string());
                        }
                    }
                    Some(ConnCmd::Shutdown) | None => return LinkExit::Shutdown,
                },
                incoming = link.next_event() => match incoming {
                    Some(Ok(LinkEvent::Event(event))) => {
                        // Нет подписчиков - не ошибка
                        let _ = self.events.send(event);
                    }
                    Some(Ok(LinkEvent::Ping(payload))) => {
                        if let Err(e) = link.send(OutboundFrame::Pong(payload)).await {
                            return LinkExit::Lost(e.to_string());
                        }
                    }
                    Some(Err(e)) => return LinkExit::Lost(e.to_string()),
                    None => return LinkExit::Lost("transport closed".to_string()),
                },
            }
        }
    }

    /// Ждать задержку backoff; `false`, если пришёл teardown
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(ConnCmd::Emit(_)) => debug!("Push channel offline, dropping outbound event"),
                    Some(ConnCmd::Shutdown) | None => return false,
                },
            }
        }
    }

    fn finish_teardown(&mut self) {
        self.reconnect.reset();
        self.state.send_replace(ConnectionState::disconnected());
        let _ = self.lifecycle.send(LifecycleEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });
        info!("Push channel closed by client");
    }

    fn set_state(&self, status: ConnectionStatus) {
        self.state.send_replace(ConnectionState {
            status,
            reconnect_attempts: self.reconnect.attempts(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_fixed_delay_schedule() {
        let mut reconnect = ReconnectState::from_config(&config());
        let delays: Vec<_> = (0..5).map(|_| reconnect.next_delay()).collect();

        assert!(delays.iter().all(|d| *d == Duration::from_secs(1)));
        assert_eq!(reconnect.attempts(), 5);
        assert!(!reconnect.can_retry());

        reconnect.reset();
        assert!(reconnect.can_retry());
        assert_eq!(reconnect.attempts(), 0);
    }

    #[test]
    fn test_multiplier_is_capped() {
        let mut cfg = config();
        cfg.reconnect_backoff_multiplier = 2;
        let mut reconnect = ReconnectState::from_config(&cfg);

        let delays: Vec<u64> = (0..5)
            .map(|_| reconnect.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_channel_ref_without_manager() {
        let channel = {
            let manager = ConnectionManager::new(
                crate::protocol::transport::WsTransport::new(),
                config(),
            );
            manager.channel()
        };

        assert!(channel.active().is_none());
        assert!(!channel.emit(ClientEvent::Typing(crate::protocol::messages::TypingData {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            recipient_id: None,
        })));
    }
}
