// Корневое состояние клиента support chat
//
// Связывает подключение, конвейер доставки, лог сообщений, индекс бесед
// и координатор набора текста для одной сессии.

use crate::api::conversations::open_conversation_with;
use crate::api::messaging::{DeliveryPipeline, Draft, SendFailure};
use crate::api::ChatApi;
use crate::config::Config;
use crate::protocol::messages::ServerEvent;
use crate::protocol::transport::PushTransport;
use crate::protocol::validation::{validate_conversation, validate_path_id};
use crate::state::connection::{ConnectionHandle, ConnectionManager, ConnectionState, EventSink};
use crate::state::conversations::{ConversationIndex, ConversationUpdate, UpdateOutcome};
use crate::state::messages::{LogNotifier, MessageStore, Notifier};
use crate::state::session::Session;
use crate::state::typing::TypingCoordinator;
use crate::storage::models::{Conversation, Message};
use crate::utils::error::{ChatError, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Состояние UI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiStatus {
    pub is_loading: bool,
    pub error_message: Option<String>,
    pub notification: Option<String>,
}

impl UiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.is_loading = loading;
    }

    pub fn set_error(&mut self, error: String) {
        self.error_message = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error_message = None;
    }

    pub fn set_notification(&mut self, notification: String) {
        self.notification = Some(notification);
    }

    pub fn clear_notification(&mut self) {
        self.notification = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Состояние, общее для клиента и обработчика push-событий
struct Shared<A: ChatApi> {
    session: Session,
    api: Arc<A>,
    store: Arc<Mutex<MessageStore>>,
    index: Mutex<ConversationIndex>,
    typing: Mutex<TypingCoordinator>,
    active: Mutex<Option<Conversation>>,
    status: Mutex<UiStatus>,
}

impl<A: ChatApi> Shared<A> {
    /// Ошибка действия пользователя превращается в строку статуса
    fn report<T>(&self, action: &str, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            warn!("{} failed: {}", action, error);
            lock(&self.status).set_error(error.user_message(self.session.role));
        }
        result
    }

    async fn refresh_conversations(&self) -> Result<()> {
        let conversations = self.api.list_conversations().await?;
        debug!("Conversation index refreshed ({} entries)", conversations.len());
        lock(&self.index).replace_all(conversations);
        Ok(())
    }

    /// Перезагрузить лог активной беседы; устаревший ответ отбрасывается
    async fn reload_active(&self) -> Result<()> {
        let active = lock(&self.store).active_conversation().map(str::to_string);
        let Some(conversation_id) = active else {
            return Ok(());
        };
        let messages = self.api.list_messages(&conversation_id).await?;
        if !lock(&self.store).populate(&conversation_id, messages) {
            debug!("Discarded stale reload for {}", conversation_id);
        }
        Ok(())
    }

    /// Восстановиться после пропущенных push-событий
    async fn resync(&self) {
        if let Err(e) = self.refresh_conversations().await {
            warn!("Conversation index resync failed: {}", e);
        }
        if let Err(e) = self.reload_active().await {
            warn!("Active conversation resync failed: {}", e);
        }
    }

    async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(data) => {
                let message = match Message::try_from(data) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping malformed new_message event: {}", e);
                        return;
                    }
                };

                lock(&self.typing).on_remote_message(&message.conversation_id, &message.sender.id);

                let update = ConversationUpdate::from(&message);
                if !lock(&self.store).merge(message) {
                    debug!("new_message {} not merged into active log", update.conversation_id);
                }

                let outcome = lock(&self.index).apply_update(&update);
                if matches!(outcome, UpdateOutcome::Unknown) {
                    info!(
                        "Conversation {} not in index, refreshing from server",
                        update.conversation_id
                    );
                    if let Err(e) = self.refresh_conversations().await {
                        warn!("Conversation index refresh failed: {}", e);
                    }
                }
            }
            ServerEvent::Typing(data) => lock(&self.typing).on_remote_typing(&data),
            ServerEvent::StopTyping(data) => lock(&self.typing).on_remote_stop(&data),
        }
    }
}

async fn run_event_pump<A: ChatApi>(shared: Arc<Shared<A>>, mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => shared.handle_event(event).await,
            Err(RecvError::Lagged(skipped)) => {
                // Пропущенные события восстанавливаются полной перезагрузкой
                // индекса и лога активной беседы
                warn!("Event pump lagged by {} events, resyncing", skipped);
                shared.resync().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Event pump stopped");
}

/// Клиент support chat для одной сессии
pub struct ChatClient<A: ChatApi + 'static, T: PushTransport> {
    config: Config,
    connection: ConnectionManager<T>,
    shared: Arc<Shared<A>>,
    pipeline: DeliveryPipeline<A>,
    pump: Option<JoinHandle<()>>,
}

impl<A: ChatApi + 'static, T: PushTransport> ChatClient<A, T> {
    pub fn new(session: Session, config: Config, api: Arc<A>, transport: T) -> Self {
        Self::with_notifier(session, config, api, transport, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        session: Session,
        config: Config,
        api: Arc<A>,
        transport: T,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let connection = ConnectionManager::new(transport, config.clone());
        let sink: Arc<dyn EventSink> = Arc::new(connection.channel());
        let store = Arc::new(Mutex::new(MessageStore::new(&session.user_id, notifier)));

        let pipeline = DeliveryPipeline::new(api.clone(), store.clone(), sink.clone(), &session.user_id);
        let shared = Arc::new(Shared {
            index: Mutex::new(ConversationIndex::new(&session.user_id)),
            typing: Mutex::new(TypingCoordinator::new(&session.user_id, sink, &config)),
            active: Mutex::new(None),
            status: Mutex::new(UiStatus::new()),
            session,
            api,
            store,
        });

        Self {
            config,
            connection,
            shared,
            pipeline,
            pump: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    // === Подключение ===

    /// Открыть push-канал; предыдущее подключение закрывается
    pub async fn connect(&mut self) -> Result<ConnectionHandle> {
        self.stop_pump();
        let result = self.connection.connect(&self.shared.session).await;
        let handle = self.shared.report("Connect", result)?;

        let events = handle.subscribe();
        self.pump = Some(tokio::spawn(run_event_pump(self.shared.clone(), events)));
        Ok(handle)
    }

    pub async fn disconnect(&mut self) {
        self.stop_pump();
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn active_connection(&self) -> Option<ConnectionHandle> {
        self.connection.get_active()
    }

    /// Выход из сессии: всё состояние сбрасывается
    pub async fn logout(&mut self) {
        self.disconnect().await;
        self.close_conversation();
        lock(&self.shared.index).clear();
        *lock(&self.shared.status) = UiStatus::new();
        info!("Session for {} closed", self.shared.session.user_id);
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    // === Беседы ===

    pub async fn refresh_conversations(&self) -> Result<()> {
        lock(&self.shared.status).set_loading(true);
        let result = self.shared.refresh_conversations().await;
        lock(&self.shared.status).set_loading(false);
        self.shared.report("Load conversations", result)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.shared.index).list().to_vec()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        lock(&self.shared.active).clone()
    }

    /// Сделать беседу активной и загрузить её сообщения.
    ///
    /// Некорректная беседа даёт `InvalidConversation` без побочных
    /// эффектов. Ответ, пришедший после переключения на другую беседу,
    /// отбрасывается.
    pub async fn open_conversation(&self, conversation: &Conversation) -> Result<()> {
        let validated = validate_conversation(conversation).and_then(|_| {
            conversation
                .counterpart(&self.shared.session.user_id)
                .map(|user| user.id.clone())
                .ok_or_else(|| {
                    ChatError::InvalidConversation(format!(
                        "{} is not a participant of {}",
                        self.shared.session.user_id, conversation.id
                    ))
                })
        });
        let recipient_id = self.shared.report("Open conversation", validated)?;

        lock(&self.shared.store).activate(&conversation.id);
        lock(&self.shared.typing).activate(&conversation.id, &recipient_id);
        *lock(&self.shared.active) = Some(conversation.clone());
        lock(&self.shared.status).clear_error();

        let loaded = self.shared.api.list_messages(&conversation.id).await;
        let messages = self.shared.report("Load messages", loaded)?;
        if !lock(&self.shared.store).populate(&conversation.id, messages) {
            debug!("Discarded stale message load for {}", conversation.id);
        }
        Ok(())
    }

    /// Найти или создать беседу с пользователем и открыть её
    pub async fn open_conversation_with(&self, user_id: &str) -> Result<Conversation> {
        let result = match validate_path_id(user_id) {
            Ok(()) => {
                open_conversation_with(
                    self.shared.api.as_ref(),
                    user_id,
                    self.config.duplicate_create_retry_delay(),
                )
                .await
            }
            Err(e) => Err(e),
        };
        let conversation = self.shared.report("Open conversation", result)?;

        lock(&self.shared.index).upsert(conversation.clone());
        self.open_conversation(&conversation).await?;
        Ok(conversation)
    }

    /// Закрыть активную беседу (уход с экрана)
    pub fn close_conversation(&self) {
        lock(&self.shared.typing).release();
        lock(&self.shared.store).deactivate();
        *lock(&self.shared.active) = None;
    }

    /// Сбросить счётчик непрочитанных локально
    pub fn mark_read(&self, conversation_id: &str) -> bool {
        lock(&self.shared.index).mark_read(conversation_id)
    }

    /// Количество непрочитанных по данным сервера
    pub async fn unread_total(&self) -> Result<u64> {
        let result = self.shared.api.unread_count().await;
        self.shared.report("Unread count", result)
    }

    // === Сообщения ===

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.shared.store).messages().to_vec()
    }

    /// Отправить черновик в активную беседу.
    ///
    /// При ошибке черновик возвращается в `SendFailure` для повтора.
    pub async fn send_message(&self, draft: Draft) -> std::result::Result<Message, SendFailure> {
        let Some(conversation) = self.active_conversation() else {
            let error = ChatError::InvalidConversation("No active conversation".to_string());
            lock(&self.shared.status).set_error(error.user_message(self.shared.session.role));
            return Err(SendFailure { error, draft });
        };

        lock(&self.shared.status).set_loading(true);
        let result = self.pipeline.send(&conversation, draft).await;
        lock(&self.shared.status).set_loading(false);

        match result {
            Ok(message) => {
                let update = ConversationUpdate::from(&message);
                let mut index = lock(&self.shared.index);
                if matches!(index.apply_update(&update), UpdateOutcome::Unknown) {
                    let mut conversation = conversation;
                    conversation.last_message = Some(update.last_message);
                    conversation.updated_at = update.updated_at;
                    index.upsert(conversation);
                }
                Ok(message)
            }
            Err(failure) => {
                lock(&self.shared.status)
                    .set_error(failure.error.user_message(self.shared.session.role));
                Err(failure)
            }
        }
    }

    /// Удалить сообщение (только администратор)
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let result = self.shared.api.delete_message(message_id).await;
        self.shared.report("Delete message", result)?;
        lock(&self.shared.store).remove(message_id);
        Ok(())
    }

    /// Применить событие push-канала напрямую (то же, что делает
    /// фоновый обработчик)
    pub async fn handle_event(&self, event: ServerEvent) {
        self.shared.handle_event(event).await;
    }

    // === Набор текста ===

    /// Нажатие клавиши. Таймер тишины запускается на runtime, в котором
    /// создан клиент; без runtime нажатие игнорируется.
    pub fn keystroke(&self) {
        lock(&self.shared.typing).keystroke();
    }

    pub fn is_typing_locally(&self) -> bool {
        lock(&self.shared.typing).is_typing_locally()
    }

    pub fn is_remote_typing(&self) -> bool {
        lock(&self.shared.typing).is_remote_typing()
    }

    // === UI ===

    pub fn status(&self) -> UiStatus {
        lock(&self.shared.status).clone()
    }

    pub fn clear_error(&self) {
        lock(&self.shared.status).clear_error();
    }
}

impl<A: ChatApi + 'static, T: PushTransport> Drop for ChatClient<A, T> {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_status_transitions() {
        let mut status = UiStatus::new();
        status.set_loading(true);
        status.set_error("boom".to_string());
        assert!(status.is_loading);
        assert_eq!(status.error_message.as_deref(), Some("boom"));

        status.clear_error();
        status.set_loading(false);
        assert_eq!(status, UiStatus::default());
    }
}
