// Типы ошибок

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Нет сессии или токена: подключение не выполняется и не повторяется
    #[error("No authenticated session available")]
    AuthMissing,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Гонка при создании беседы (duplicate key на сервере)
    #[error("Conversation already exists for this participant pair")]
    DuplicateCreate,

    #[error("Invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(error: serde_json::Error) -> Self {
        ChatError::SerializationError(error.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ChatError::SerializationError(error.to_string())
        } else {
            ChatError::PersistenceFailure(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::ConnectionError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
