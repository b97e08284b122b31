// Модели данных ядра синхронизации

use crate::state::session::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ссылка на пользователя (участник беседы или отправитель)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: Option<String>,
    pub role: Option<Role>,
}

impl UserRef {
    pub fn id_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            role: None,
        }
    }
}

/// Содержимое сообщения: текст и/или изображение, но не пустое
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    Image(String),
    TextWithImage { text: String, image_url: String },
}

impl MessageBody {
    /// Собрать тело из опциональных полей; `None`, если оба отсутствуют
    pub fn from_parts(content: Option<String>, image_url: Option<String>) -> Option<Self> {
        let content = content.filter(|c| !c.is_empty());
        let image_url = image_url.filter(|u| !u.is_empty());
        match (content, image_url) {
            (Some(text), Some(image_url)) => Some(MessageBody::TextWithImage { text, image_url }),
            (Some(text), None) => Some(MessageBody::Text(text)),
            (None, Some(url)) => Some(MessageBody::Image(url)),
            (None, None) => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) | MessageBody::TextWithImage { text, .. } => Some(text),
            MessageBody::Image(_) => None,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            MessageBody::Image(url) | MessageBody::TextWithImage { image_url: url, .. } => Some(url),
            MessageBody::Text(_) => None,
        }
    }
}

/// Сохранённое сообщение (каноническая форма от сервера)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: UserRef,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn content(&self) -> Option<&str> {
        self.body.content()
    }

    pub fn image_url(&self) -> Option<&str> {
        self.body.image_url()
    }

    /// Снимок для списка бесед
    pub fn snapshot(&self) -> LastMessage {
        LastMessage {
            content: self.content().map(str::to_string),
            created_at: self.created_at,
        }
    }
}

/// Снимок последнего сообщения беседы
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Беседа двух участников
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Ровно два участника у корректной беседы (см. `validate_conversation`)
    pub participants: Vec<UserRef>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Собеседник относительно локального пользователя.
    ///
    /// `None`, если локальный пользователь не участник беседы.
    pub fn counterpart(&self, local_user_id: &str) -> Option<&UserRef> {
        if !self.has_participant(local_user_id) {
            return None;
        }
        self.participants.iter().find(|p| p.id != local_user_id)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_requires_content_or_image() {
        assert_eq!(MessageBody::from_parts(None, None), None);
        assert_eq!(MessageBody::from_parts(Some(String::new()), None), None);
        assert_eq!(
            MessageBody::from_parts(Some("hi".into()), None),
            Some(MessageBody::Text("hi".into()))
        );

        let both = MessageBody::from_parts(Some("look".into()), Some("data:image/png;base64,AA".into()))
            .unwrap();
        assert_eq!(both.content(), Some("look"));
        assert_eq!(both.image_url(), Some("data:image/png;base64,AA"));
    }

    #[test]
    fn test_counterpart() {
        let conversation = Conversation {
            id: "c1".into(),
            participants: vec![UserRef::id_only("seller"), UserRef::id_only("admin")],
            last_message: None,
            unread_count: 0,
            updated_at: Utc::now(),
        };

        assert_eq!(conversation.counterpart("seller").unwrap().id, "admin");
        assert!(conversation.has_participant("admin"));
        assert!(!conversation.has_participant("stranger"));
        assert!(conversation.counterpart("stranger").is_none());
    }
}
