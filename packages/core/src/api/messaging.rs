// Путь отправки сообщения
//
// 1. изображение кодируется в data URL;
// 2. запись через REST;
// 3. канонический ответ сливается в MessageStore;
// 4. то же сообщение рассылается собеседнику через push-канал.

use crate::api::ChatApi;
use crate::protocol::messages::{ClientEvent, MessageData, SendMessageData};
use crate::protocol::validation::{validate_conversation, validate_outgoing};
use crate::state::connection::EventSink;
use crate::state::messages::MessageStore;
use crate::storage::models::{Conversation, Message};
use crate::utils::b64;
use crate::utils::error::ChatError;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Вложенное изображение
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    pub fn new(mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            bytes,
        }
    }

    pub fn to_data_url(&self) -> String {
        b64::to_data_url(&self.mime, &self.bytes)
    }
}

/// Незафиксированный ввод пользователя
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub content: String,
    pub image: Option<ImageAttachment>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    pub fn is_sendable(&self) -> bool {
        validate_outgoing(Some(&self.content), self.image.is_some()).is_ok()
    }
}

/// Ошибка отправки; черновик возвращается вызывающему для повтора
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SendFailure {
    pub error: ChatError,
    pub draft: Draft,
}

/// Конвейер доставки
pub struct DeliveryPipeline<A: ChatApi + ?Sized> {
    api: Arc<A>,
    store: Arc<Mutex<MessageStore>>,
    sink: Arc<dyn EventSink>,
    local_user_id: String,
}

impl<A: ChatApi + ?Sized> DeliveryPipeline<A> {
    pub fn new(
        api: Arc<A>,
        store: Arc<Mutex<MessageStore>>,
        sink: Arc<dyn EventSink>,
        local_user_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            store,
            sink,
            local_user_id: local_user_id.into(),
        }
    }

    /// Отправить черновик в беседу.
    ///
    /// Оптимистичная запись не создаётся: сообщение появляется в логе
    /// только после канонического ответа сервера.
    pub async fn send(&self, conversation: &Conversation, draft: Draft) -> Result<Message, SendFailure> {
        if let Err(error) = validate_conversation(conversation)
            .and_then(|_| validate_outgoing(Some(&draft.content), draft.image.is_some()))
        {
            return Err(SendFailure { error, draft });
        }

        let recipient_id = match conversation.counterpart(&self.local_user_id) {
            Some(user) => user.id.clone(),
            None => {
                return Err(SendFailure {
                    error: ChatError::InvalidConversation(format!(
                        "{} is not a participant of {}",
                        self.local_user_id, conversation.id
                    )),
                    draft,
                })
            }
        };

        let body = SendMessageData {
            content: draft.content.trim().to_string(),
            image_base64: draft.image.as_ref().map(ImageAttachment::to_data_url),
        };

        let message = match self.api.send_message(&conversation.id, &body).await {
            Ok(message) => message,
            Err(error) => {
                warn!("Send to conversation {} failed: {}", conversation.id, error);
                return Err(SendFailure {
                    error: normalize_send_error(error),
                    draft,
                });
            }
        };

        let merged = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .merge(message.clone());
        if !merged {
            debug!("Sent message {} already present or conversation inactive", message.id);
        }

        let event = ClientEvent::SendMessage(MessageData::outbound(&message, &recipient_id));
        if !self.sink.emit(event) {
            debug!("Push channel unavailable, recipient will see {} on next load", message.id);
        }

        Ok(message)
    }
}

fn normalize_send_error(error: ChatError) -> ChatError {
    match error {
        ChatError::Forbidden(_)
        | ChatError::NotFound(_)
        | ChatError::AuthMissing
        | ChatError::PersistenceFailure(_)
        | ChatError::InvalidInput(_) => error,
        other => ChatError::PersistenceFailure(other.to_string()),
    }
}
