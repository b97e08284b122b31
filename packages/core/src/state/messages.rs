// Лог сообщений активной беседы
//
// `merge` идемпотентен и не зависит от порядка: ответ REST и эхо из
// push-канала с тем же id оставляют ровно одну запись.

use crate::storage::models::Message;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Звуковое (или иное) уведомление о входящем сообщении. Best-effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &Message);
}

/// Уведомление через лог; по умолчанию для хостов без звука
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &Message) {
        tracing::info!(
            "New message {} from {} in conversation {}",
            message.id,
            message.sender.id,
            message.conversation_id
        );
    }
}

/// Хранилище сообщений одной (активной) беседы
pub struct MessageStore {
    local_user_id: String,
    active: Option<String>,
    messages: Vec<Message>,
    ids: HashSet<String>,
    notifier: Arc<dyn Notifier>,
}

impl MessageStore {
    pub fn new(local_user_id: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            active: None,
            messages: Vec::new(),
            ids: HashSet::new(),
            notifier,
        }
    }

    /// Сделать беседу активной; лог предыдущей отбрасывается
    pub fn activate(&mut self, conversation_id: &str) {
        self.active = Some(conversation_id.to_string());
        self.clear();
    }

    pub fn deactivate(&mut self) {
        self.active = None;
        self.clear();
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.as_deref() == Some(conversation_id)
    }

    /// Применить результат `load`.
    ///
    /// Ответ для уже неактивной беседы отклоняется (`false`). Сообщения,
    /// пришедшие через push во время загрузки, сохраняются.
    pub fn populate(&mut self, conversation_id: &str, loaded: Vec<Message>) -> bool {
        if !self.is_active(conversation_id) {
            debug!("Dropping stale load for conversation {}", conversation_id);
            return false;
        }

        for message in loaded {
            if message.conversation_id != conversation_id || self.ids.contains(&message.id) {
                continue;
            }
            self.insert_ordered(message);
        }
        true
    }

    /// Слить входящее сообщение. `true`, если добавлена новая запись.
    pub fn merge(&mut self, incoming: Message) -> bool {
        if !self.is_active(&incoming.conversation_id) {
            debug!(
                "Ignoring message {} for inactive conversation {}",
                incoming.id, incoming.conversation_id
            );
            return false;
        }

        if self.ids.contains(&incoming.id) {
            debug!("Message {} already present", incoming.id);
            return false;
        }

        let from_remote = incoming.sender.id != self.local_user_id;
        if from_remote {
            self.notifier.notify(&incoming);
        }
        self.insert_ordered(incoming);
        true
    }

    /// Удалить сообщение из лога
    pub fn remove(&mut self, message_id: &str) -> bool {
        if !self.ids.remove(message_id) {
            return false;
        }
        self.messages.retain(|m| m.id != message_id);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn insert_ordered(&mut self, message: Message) {
        let position = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(position, message);
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{MessageBody, UserRef};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl Notifier for CountingNotifier {
        fn notify(&self, _message: &Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn message(id: &str, conversation: &str, sender: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: conversation.into(),
            sender: UserRef::id_only(sender),
            body: MessageBody::Text(format!("text {}", id)),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn store() -> (MessageStore, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let mut store = MessageStore::new("me", notifier.clone());
        store.activate("c1");
        (store, notifier)
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (mut store, _) = store();

        assert!(store.merge(message("m1", "c1", "me", 0)));
        assert!(!store.merge(message("m1", "c1", "me", 0)));
        assert!(!store.merge(message("m1", "c1", "me", 0)));

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_echo_before_and_after_rest_response() {
        // Эхо пришло раньше ответа REST
        let (mut store, _) = store();
        store.merge(message("m1", "c1", "me", 0));
        store.merge(message("m1", "c1", "me", 0));
        assert_eq!(store.messages().iter().filter(|m| m.id == "m1").count(), 1);

        // Более старое сообщение приходит после более нового
        store.merge(message("m0", "c1", "other", -10));
        assert_eq!(store.messages()[0].id, "m0");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_other_conversation_is_ignored() {
        let (mut store, notifier) = store();
        assert!(!store.merge(message("m9", "c2", "other", 0)));
        assert!(store.is_empty());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_notifies_only_for_remote_senders() {
        let (mut store, notifier) = store();
        store.merge(message("m1", "c1", "me", 0));
        store.merge(message("m2", "c1", "other", 1));
        store.merge(message("m2", "c1", "other", 1));

        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_populate_keeps_pushed_messages_and_rejects_stale() {
        let (mut store, _) = store();
        store.merge(message("m3", "c1", "other", 30));

        let loaded = vec![
            message("m1", "c1", "me", 10),
            message("m2", "c1", "other", 20),
            message("m3", "c1", "other", 30),
        ];
        assert!(store.populate("c1", loaded));
        let ids: Vec<_> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        store.activate("c2");
        assert!(store.is_empty());
        assert!(!store.populate("c1", vec![message("m4", "c1", "me", 40)]));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove() {
        let (mut store, _) = store();
        store.merge(message("m1", "c1", "me", 0));
        assert!(store.remove("m1"));
        assert!(!store.remove("m1"));
        assert!(!store.contains("m1"));
        // После удаления то же сообщение снова может быть принято
        assert!(store.merge(message("m1", "c1", "me", 0)));
    }
}
