// Wire format (JSON текстовые фреймы)
// Используется для передачи событий через push-канал

use crate::protocol::messages::{ClientEvent, ServerEvent};
use crate::utils::error::{ChatError, Result};

/// Упаковать ClientEvent в текстовый фрейм (клиент -> сервер)
pub fn pack_client_event(event: &ClientEvent) -> Result<String> {
    serde_json::to_string(event)
        .map_err(|e| ChatError::SerializationError(format!("Event pack error: {}", e)))
}

/// Распаковать текстовый фрейм в ServerEvent (сервер -> клиент)
pub fn unpack_server_event(frame: &str) -> Result<ServerEvent> {
    serde_json::from_str(frame)
        .map_err(|e| ChatError::SerializationError(format!("Event unpack error: {}", e)))
}

/// Упаковать ServerEvent (нужно in-memory транспорту и тестам)
pub fn pack_server_event(event: &ServerEvent) -> Result<String> {
    serde_json::to_string(event)
        .map_err(|e| ChatError::SerializationError(format!("Event pack error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::TypingData;

    #[test]
    fn test_unpack_typing_event() {
        let frame = r#"{"event":"typing","data":{"conversationId":"c1","userId":"u2"}}"#;
        let event = unpack_server_event(frame).unwrap();
        assert_eq!(
            event,
            ServerEvent::Typing(TypingData {
                conversation_id: "c1".into(),
                user_id: "u2".into(),
                recipient_id: None,
            })
        );
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        let frame = r#"{"event":"user_banned","data":{}}"#;
        assert!(matches!(
            unpack_server_event(frame),
            Err(ChatError::SerializationError(_))
        ));
    }
}
