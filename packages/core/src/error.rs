// Перевод ошибок в пользовательские статусы

pub use crate::utils::error::{ChatError, Result};

use crate::state::session::Role;

impl ChatError {
    /// Строка статуса для UI. `Forbidden` формулируется по роли.
    pub fn user_message(&self, role: Role) -> String {
        match self {
            ChatError::AuthMissing => "Your session has expired. Please sign in again.".to_string(),
            ChatError::ConnectionError(_) => {
                "Live updates are unavailable. Messages will still be saved.".to_string()
            }
            ChatError::NotFound(_) => "This conversation no longer exists.".to_string(),
            ChatError::Forbidden(_) => match role {
                Role::Seller => {
                    "You can only message support from your own conversations.".to_string()
                }
                Role::Admin => {
                    "You are not a participant of this conversation. Open it from the seller list."
                        .to_string()
                }
            },
            ChatError::DuplicateCreate => {
                "The conversation is being created. Please try again in a moment.".to_string()
            }
            ChatError::InvalidConversation(_) => {
                "This conversation is invalid and cannot be opened.".to_string()
            }
            ChatError::InvalidInput(_) => "Enter a message or attach an image.".to_string(),
            ChatError::PersistenceFailure(_) | ChatError::SerializationError(_) => {
                "Something went wrong. Your message was kept so you can retry.".to_string()
            }
        }
    }

    /// Имеет ли смысл повторить действие
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::ConnectionError(_)
                | ChatError::PersistenceFailure(_)
                | ChatError::DuplicateCreate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_guidance_depends_on_role() {
        let error = ChatError::Forbidden("not a participant".into());
        let seller = error.user_message(Role::Seller);
        let admin = error.user_message(Role::Admin);

        assert_ne!(seller, admin);
        assert!(seller.contains("support"));
        assert!(admin.contains("participant"));
    }

    #[test]
    fn test_retryable() {
        assert!(ChatError::PersistenceFailure("500".into()).is_retryable());
        assert!(!ChatError::NotFound("c1".into()).is_retryable());
        assert!(!ChatError::AuthMissing.is_retryable());
    }
}
