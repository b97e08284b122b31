// Список бесед с live-обновлением из push-событий

use crate::storage::models::{Conversation, LastMessage, Message};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Обновление беседы, построенное из события `new_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub conversation_id: String,
    pub sender_id: String,
    pub last_message: LastMessage,
    pub updated_at: DateTime<Utc>,
}

impl From<&Message> for ConversationUpdate {
    fn from(message: &Message) -> Self {
        Self {
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender.id.clone(),
            last_message: message.snapshot(),
            updated_at: message.created_at,
        }
    }
}

/// Результат `apply_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Беседы нет в списке: список нужно перечитать целиком
    Unknown,
}

/// Упорядоченный (по `updated_at` убыв.) список бесед
#[derive(Debug)]
pub struct ConversationIndex {
    local_user_id: String,
    conversations: Vec<Conversation>,
}

impl ConversationIndex {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            conversations: Vec::new(),
        }
    }

    /// Заменить список целиком (результат REST)
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
        self.sort();
    }

    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    /// Применить событие о новом сообщении.
    ///
    /// Непрочитанные увеличиваются только для чужих сообщений. Частичные
    /// записи для неизвестных бесед не создаются.
    pub fn apply_update(&mut self, update: &ConversationUpdate) -> UpdateOutcome {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == update.conversation_id)
        else {
            debug!(
                "Conversation {} not in index, refresh required",
                update.conversation_id
            );
            return UpdateOutcome::Unknown;
        };

        conversation.last_message = Some(update.last_message.clone());
        conversation.updated_at = update.updated_at;
        if update.sender_id != self.local_user_id {
            conversation.unread_count += 1;
        }

        self.sort();
        UpdateOutcome::Applied
    }

    /// Добавить или заменить одну беседу (результат get-or-create)
    pub fn upsert(&mut self, conversation: Conversation) {
        match self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        self.sort();
    }

    /// Сбросить счётчик непрочитанных. Вызывается только явно.
    pub fn mark_read(&mut self, conversation_id: &str) -> bool {
        match self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            Some(conversation) => {
                conversation.unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Общее количество непрочитанных по списку
    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::UserRef;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn conversation(id: &str, updated: i64) -> Conversation {
        Conversation {
            id: id.into(),
            participants: vec![UserRef::id_only("me"), UserRef::id_only("admin")],
            last_message: None,
            unread_count: 0,
            updated_at: at(updated),
        }
    }

    fn update(id: &str, sender: &str, secs: i64) -> ConversationUpdate {
        ConversationUpdate {
            conversation_id: id.into(),
            sender_id: sender.into(),
            last_message: LastMessage {
                content: Some("ping".into()),
                created_at: at(secs),
            },
            updated_at: at(secs),
        }
    }

    fn ids(index: &ConversationIndex) -> Vec<&str> {
        index.list().iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_list_is_sorted_desc() {
        let mut index = ConversationIndex::new("me");
        index.replace_all(vec![
            conversation("a", 1),
            conversation("c", 3),
            conversation("b", 2),
        ]);
        assert_eq!(ids(&index), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_update_moves_conversation_to_front() {
        let mut index = ConversationIndex::new("me");
        index.replace_all(vec![
            conversation("a", 1),
            conversation("b", 2),
            conversation("c", 3),
        ]);

        assert_eq!(index.apply_update(&update("a", "admin", 10)), UpdateOutcome::Applied);
        assert_eq!(ids(&index), vec!["a", "c", "b"]);

        let a = index.get("a").unwrap();
        assert_eq!(a.updated_at, at(10));
        assert_eq!(a.last_message.as_ref().unwrap().content.as_deref(), Some("ping"));
    }

    #[test]
    fn test_unread_accounting() {
        let mut index = ConversationIndex::new("me");
        index.replace_all(vec![conversation("a", 1)]);

        index.apply_update(&update("a", "me", 2));
        assert_eq!(index.get("a").unwrap().unread_count, 0);

        index.apply_update(&update("a", "admin", 3));
        assert_eq!(index.get("a").unwrap().unread_count, 1);

        index.apply_update(&update("a", "admin", 4));
        assert_eq!(index.total_unread(), 2);

        assert!(index.mark_read("a"));
        assert_eq!(index.total_unread(), 0);
    }

    #[test]
    fn test_unknown_conversation_requests_refresh() {
        let mut index = ConversationIndex::new("me");
        index.replace_all(vec![conversation("a", 1)]);

        assert_eq!(index.apply_update(&update("zzz", "admin", 5)), UpdateOutcome::Unknown);
        assert_eq!(index.len(), 1);
        assert!(index.get("zzz").is_none());
    }

    #[test]
    fn test_upsert() {
        let mut index = ConversationIndex::new("me");
        index.replace_all(vec![conversation("a", 5)]);
        index.upsert(conversation("b", 1));
        index.upsert(conversation("b", 9));
        assert_eq!(ids(&index), vec!["b", "a"]);
    }
}
