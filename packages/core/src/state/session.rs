// Контекст сессии

use crate::utils::error::{ChatError, Result};
use serde::{Deserialize, Serialize};

/// Роль пользователя в support chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Seller,
}

/// Аутентифицированная сессия.
///
/// Создаётся внешним auth-коллаборатором при входе и передаётся в
/// компоненты явно; ядро её только читает.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub auth_token: String,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
            auth_token: auth_token.into(),
        }
    }

    /// Проверить, что сессия пригодна для подключения
    pub fn require_token(&self) -> Result<&str> {
        let token = self.auth_token.trim();
        if token.is_empty() || self.user_id.trim().is_empty() {
            return Err(ChatError::AuthMissing);
        }
        Ok(token)
    }

    /// Значение заголовка `Authorization`
    pub fn bearer(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.require_token()?))
    }

    pub fn is_local_user(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_token() {
        let session = Session::new("u1", "Alice", Role::Seller, "tok");
        assert_eq!(session.require_token().unwrap(), "tok");
        assert_eq!(session.bearer().unwrap(), "Bearer tok");
    }

    #[test]
    fn test_blank_token_is_auth_missing() {
        let session = Session::new("u1", "Alice", Role::Seller, "  ");
        assert_eq!(session.require_token(), Err(ChatError::AuthMissing));

        let anonymous = Session::new("", "Nobody", Role::Admin, "tok");
        assert_eq!(anonymous.bearer(), Err(ChatError::AuthMissing));
    }
}
