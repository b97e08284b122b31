// Публичный API для support chat
// REST-коллаборатор и путь отправки сообщений

pub mod conversations;
pub mod http;
pub mod messaging;

use crate::protocol::messages::SendMessageData;
use crate::storage::models::{Conversation, Message};
use crate::utils::error::Result;
use async_trait::async_trait;

pub use http::HttpChatApi;
pub use messaging::{DeliveryPipeline, Draft, ImageAttachment, SendFailure};

/// Зарезервированный псевдоним собеседника-администратора
pub const ADMIN_ALIAS: &str = "admin";

/// С кем искать беседы
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Counterpart {
    User(String),
    /// Любой администратор (псевдоним `admin`)
    Admin,
}

impl Counterpart {
    pub fn path_segment(&self) -> &str {
        match self {
            Counterpart::User(id) => id,
            Counterpart::Admin => ADMIN_ALIAS,
        }
    }
}

/// REST API персистентности (/chat/...)
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// GET /chat/conversations
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// GET /chat/conversations/user/{userId|admin}
    async fn list_conversations_with(&self, counterpart: &Counterpart) -> Result<Vec<Conversation>>;

    /// POST /chat/conversations {recipientId}
    async fn create_conversation(&self, recipient_id: &str) -> Result<Conversation>;

    /// GET /chat/conversations/with/{userId}
    async fn conversation_with(&self, user_id: &str) -> Result<Conversation>;

    /// GET /chat/conversations/{id}/messages
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// POST /chat/conversations/{id}/messages
    async fn send_message(&self, conversation_id: &str, body: &SendMessageData) -> Result<Message>;

    /// DELETE /chat/messages/{id}
    async fn delete_message(&self, message_id: &str) -> Result<()>;

    /// GET /chat/messages/unread
    async fn unread_count(&self) -> Result<u64>;
}
