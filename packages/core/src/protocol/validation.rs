// Валидация входящих данных

use crate::storage::models::Conversation;
use crate::utils::error::{ChatError, Result};

/// Беседа должна иметь ровно двух различных участников
pub fn validate_conversation(conversation: &Conversation) -> Result<()> {
    if conversation.id.trim().is_empty() {
        return Err(ChatError::InvalidConversation(
            "Conversation id is empty".to_string(),
        ));
    }

    if conversation.participants.len() != 2 {
        return Err(ChatError::InvalidConversation(format!(
            "Conversation {} has {} participants, expected 2",
            conversation.id,
            conversation.participants.len()
        )));
    }

    if conversation.participants[0].id == conversation.participants[1].id {
        return Err(ChatError::InvalidConversation(format!(
            "Conversation {} lists the same participant twice",
            conversation.id
        )));
    }

    Ok(())
}

/// Сообщение должно содержать непустой текст или изображение
pub fn validate_outgoing(content: Option<&str>, has_image: bool) -> Result<()> {
    let has_text = content.map(|c| !c.trim().is_empty()).unwrap_or(false);
    if !has_text && !has_image {
        return Err(ChatError::InvalidInput(
            "Message must contain text or an image".to_string(),
        ));
    }
    Ok(())
}

/// Идентификатор пользователя/беседы для подстановки в путь
pub fn validate_path_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ChatError::InvalidInput("Identifier is empty".to_string()));
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ChatError::InvalidInput(format!(
            "Identifier contains unsupported characters: {}",
            id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::UserRef;
    use chrono::Utc;

    fn conversation(participants: &[&str]) -> Conversation {
        Conversation {
            id: "c1".into(),
            participants: participants.iter().map(|p| UserRef::id_only(*p)).collect(),
            last_message: None,
            unread_count: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_two_participants_ok() {
        assert!(validate_conversation(&conversation(&["a", "b"])).is_ok());
    }

    #[test]
    fn test_malformed_conversation() {
        assert!(matches!(
            validate_conversation(&conversation(&["a"])),
            Err(ChatError::InvalidConversation(_))
        ));
        assert!(matches!(
            validate_conversation(&conversation(&["a", "a"])),
            Err(ChatError::InvalidConversation(_))
        ));
        assert!(matches!(
            validate_conversation(&conversation(&["a", "b", "c"])),
            Err(ChatError::InvalidConversation(_))
        ));
    }

    #[test]
    fn test_outgoing_requires_text_or_image() {
        assert!(validate_outgoing(Some("hi"), false).is_ok());
        assert!(validate_outgoing(None, true).is_ok());
        assert!(validate_outgoing(Some("   "), false).is_err());
        assert!(validate_outgoing(None, false).is_err());
    }

    #[test]
    fn test_path_id() {
        assert!(validate_path_id("65f1c0ffee").is_ok());
        assert!(validate_path_id("").is_err());
        assert!(validate_path_id("../admin").is_err());
    }
}
