// Открытие бесед с восстановлением после гонки создания

use crate::api::ChatApi;
use crate::storage::models::Conversation;
use crate::utils::error::{ChatError, Result};
use std::time::Duration;
use tracing::warn;

/// Найти или создать беседу с пользователем (GET /with/{userId}).
///
/// При `DuplicateCreate` ждёт `retry_delay` и один раз перечитывает
/// беседу, прежде чем вернуть ошибку.
pub async fn open_conversation_with<A: ChatApi + ?Sized>(
    api: &A,
    user_id: &str,
    retry_delay: Duration,
) -> Result<Conversation> {
    match api.conversation_with(user_id).await {
        Err(ChatError::DuplicateCreate) => recover_duplicate(api, user_id, retry_delay).await,
        other => other,
    }
}

/// Создать беседу (POST), восстанавливаясь после duplicate key тем же способом
pub async fn create_conversation<A: ChatApi + ?Sized>(
    api: &A,
    recipient_id: &str,
    retry_delay: Duration,
) -> Result<Conversation> {
    match api.create_conversation(recipient_id).await {
        Err(ChatError::DuplicateCreate) => recover_duplicate(api, recipient_id, retry_delay).await,
        other => other,
    }
}

async fn recover_duplicate<A: ChatApi + ?Sized>(
    api: &A,
    user_id: &str,
    retry_delay: Duration,
) -> Result<Conversation> {
    warn!(
        "Conversation create with {} raced, re-querying in {:?}",
        user_id, retry_delay
    );
    tokio::time::sleep(retry_delay).await;
    api.conversation_with(user_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::session::Role;
    use crate::storage::MemoryChatApi;

    fn backend() -> MemoryChatApi {
        let api = MemoryChatApi::new("seller1");
        api.register_user("seller1", "Shop One", Role::Seller);
        api.register_user("admin1", "Support", Role::Admin);
        api
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_race_is_recovered_once() {
        let api = backend();
        api.race_next_creates(1);

        let conversation = create_conversation(&api, "admin1", Duration::from_millis(500))
            .await
            .unwrap();
        assert!(conversation.has_participant("admin1"));
        assert_eq!(api.list_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_second_race() {
        let api = backend();
        api.race_next_creates(2);

        let result = open_conversation_with(&api, "admin1", Duration::from_millis(500)).await;
        assert_eq!(result.unwrap_err(), ChatError::DuplicateCreate);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let api = backend();
        let result = open_conversation_with(&api, "ghost", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }
}
