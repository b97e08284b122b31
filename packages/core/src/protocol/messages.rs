// Типы сообщений протокола
// Соответствуют REST API (/chat/...) и событиям push-канала

use crate::state::session::Role;
use crate::storage::models::{Conversation, LastMessage, Message, MessageBody, UserRef};
use crate::utils::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Пользователь на проводе: либо голый id, либо populated объект
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserData {
    Id(String),
    Profile(UserProfileData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileData {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl UserData {
    pub fn id(&self) -> &str {
        match self {
            UserData::Id(id) => id,
            UserData::Profile(profile) => &profile.id,
        }
    }
}

impl From<UserData> for UserRef {
    fn from(data: UserData) -> Self {
        match data {
            UserData::Id(id) => UserRef::id_only(id),
            UserData::Profile(profile) => UserRef {
                id: profile.id,
                name: profile.name,
                role: profile.role,
            },
        }
    }
}

impl From<&UserRef> for UserData {
    fn from(user: &UserRef) -> Self {
        if user.name.is_none() && user.role.is_none() {
            return UserData::Id(user.id.clone());
        }
        UserData::Profile(UserProfileData {
            id: user.id.clone(),
            name: user.name.clone(),
            role: user.role,
        })
    }
}

/// Сообщение на проводе.
///
/// Одна форма для ответа REST и для события `new_message`: отправитель
/// может прийти объектом `sender`, строкой `sender` или полем `senderId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Только в исходящем `send_message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
}

impl MessageData {
    /// Исходящий payload `send_message` с полным каноническим сообщением
    pub fn outbound(message: &Message, recipient_id: &str) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            content: message.content().map(str::to_string),
            sender_id: Some(message.sender.id.clone()),
            sender: Some(UserData::from(&message.sender)),
            image_url: message.image_url().map(str::to_string),
            created_at: message.created_at,
            recipient_id: Some(recipient_id.to_string()),
        }
    }
}

impl TryFrom<MessageData> for Message {
    type Error = ChatError;

    /// Отправитель определяется один раз: объект `sender`, затем `senderId`
    fn try_from(data: MessageData) -> Result<Self> {
        let sender = match (data.sender, data.sender_id) {
            (Some(sender), _) if !sender.id().is_empty() => UserRef::from(sender),
            (_, Some(sender_id)) if !sender_id.is_empty() => UserRef::id_only(sender_id),
            _ => {
                return Err(ChatError::InvalidInput(format!(
                    "Message {} has no resolvable sender",
                    data.id
                )))
            }
        };

        let body = MessageBody::from_parts(data.content, data.image_url).ok_or_else(|| {
            ChatError::InvalidInput(format!("Message {} has neither content nor image", data.id))
        })?;

        Ok(Message {
            id: data.id,
            conversation_id: data.conversation_id,
            sender,
            body,
            created_at: data.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageData {
    #[serde(default)]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Беседа в ответе REST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationData {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub participants: Vec<UserData>,
    #[serde(default)]
    pub last_message: Option<LastMessageData>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<ConversationData> for Conversation {
    fn from(data: ConversationData) -> Self {
        Conversation {
            id: data.id,
            participants: data.participants.into_iter().map(UserRef::from).collect(),
            last_message: data.last_message.map(|m| LastMessage {
                content: m.content,
                created_at: m.created_at,
            }),
            unread_count: data.unread_count,
            updated_at: data.updated_at,
        }
    }
}

impl From<&Conversation> for ConversationData {
    fn from(conversation: &Conversation) -> Self {
        ConversationData {
            id: conversation.id.clone(),
            participants: conversation.participants.iter().map(UserData::from).collect(),
            last_message: conversation.last_message.as_ref().map(|m| LastMessageData {
                content: m.content.clone(),
                created_at: m.created_at,
            }),
            unread_count: conversation.unread_count,
            updated_at: conversation.updated_at,
        }
    }
}

// ============================================================================
// REST Request Bodies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationData {
    pub recipient_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountData {
    pub count: u64,
}

// ============================================================================
// Push Channel Events
// ============================================================================

/// Сигнал набора текста
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub conversation_id: String,
    pub user_id: String,
    /// Только в исходящих сигналах
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
}

/// События от сервера (сервер -> клиент)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(MessageData),
    Typing(TypingData),
    StopTyping(TypingData),
}

/// События клиента (клиент -> сервер)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(MessageData),
    Typing(TypingData),
    StopTyping(TypingData),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sender_object_wins_over_sender_id() {
        let data: MessageData = serde_json::from_value(json!({
            "_id": "m1",
            "conversationId": "c1",
            "content": "Hello",
            "senderId": "stale",
            "sender": {"_id": "u2", "name": "Bob", "role": "admin"},
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        let message = Message::try_from(data).unwrap();
        assert_eq!(message.sender.id, "u2");
        assert_eq!(message.sender.role, Some(Role::Admin));
        assert_eq!(message.content(), Some("Hello"));
    }

    #[test]
    fn test_sender_as_plain_id_and_fallback() {
        let data: MessageData = serde_json::from_value(json!({
            "_id": "m2",
            "conversationId": "c1",
            "imageUrl": "https://cdn/x.png",
            "sender": "u3",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(Message::try_from(data).unwrap().sender.id, "u3");

        let data: MessageData = serde_json::from_value(json!({
            "_id": "m3",
            "conversationId": "c1",
            "content": "x",
            "senderId": "u4",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(Message::try_from(data).unwrap().sender.id, "u4");
    }

    #[test]
    fn test_unresolvable_payload_is_rejected() {
        let data: MessageData = serde_json::from_value(json!({
            "_id": "m4",
            "conversationId": "c1",
            "content": "orphan",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert!(matches!(Message::try_from(data), Err(ChatError::InvalidInput(_))));

        let data: MessageData = serde_json::from_value(json!({
            "_id": "m5",
            "conversationId": "c1",
            "senderId": "u1",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert!(matches!(Message::try_from(data), Err(ChatError::InvalidInput(_))));
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = ClientEvent::StopTyping(TypingData {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            recipient_id: Some("u2".into()),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "stop_typing");
        assert_eq!(value["data"]["recipientId"], "u2");
    }
}
