// In-memory бэкенд чата для тестов и офлайн-инструментов
//
// Ведёт себя как REST сервер: проверяет участников, помечает сообщения
// прочитанными при GET messages и умеет имитировать гонку создания.

use crate::api::{ChatApi, Counterpart};
use crate::protocol::messages::SendMessageData;
use crate::protocol::validation::validate_outgoing;
use crate::state::session::Role;
use crate::storage::models::{Conversation, LastMessage, Message, MessageBody, UserRef};
use crate::utils::b64;
use crate::utils::error::{ChatError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

struct StoredConversation {
    id: String,
    participants: [String; 2],
    last_message: Option<LastMessage>,
    updated_at: DateTime<Utc>,
}

impl StoredConversation {
    fn has(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    fn other(&self, user_id: &str) -> &str {
        if self.participants[0] == user_id {
            &self.participants[1]
        } else {
            &self.participants[0]
        }
    }
}

struct StoredMessage {
    message: Message,
    read_by: HashSet<String>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, UserRef>,
    conversations: Vec<StoredConversation>,
    messages: Vec<StoredMessage>,
    pending_failures: VecDeque<ChatError>,
    create_races: u32,
}

impl MemoryState {
    fn user(&self, id: &str) -> UserRef {
        self.users
            .get(id)
            .cloned()
            .unwrap_or_else(|| UserRef::id_only(id))
    }

    fn conversation(&self, id: &str) -> Result<&StoredConversation> {
        self.conversations
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {} not found", id)))
    }

    fn find_pair(&self, a: &str, b: &str) -> Option<&StoredConversation> {
        self.conversations.iter().find(|c| c.has(a) && c.has(b))
    }

    fn unread_for(&self, conversation_id: &str, user_id: &str) -> u32 {
        self.messages
            .iter()
            .filter(|m| {
                m.message.conversation_id == conversation_id
                    && m.message.sender.id != user_id
                    && !m.read_by.contains(user_id)
            })
            .count() as u32
    }

    fn view(&self, stored: &StoredConversation, caller: &str) -> Conversation {
        Conversation {
            id: stored.id.clone(),
            participants: stored.participants.iter().map(|p| self.user(p)).collect(),
            last_message: stored.last_message.clone(),
            unread_count: self.unread_for(&stored.id, caller),
            updated_at: stored.updated_at,
        }
    }

    fn insert_conversation(&mut self, a: &str, b: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.conversations.push(StoredConversation {
            id: id.clone(),
            participants: [a.to_string(), b.to_string()],
            last_message: None,
            updated_at: Utc::now(),
        });
        id
    }
}

/// In-memory реализация `ChatApi`.
///
/// Клоны делят одно состояние; `as_user` даёт клиента от имени другого
/// пользователя (как отдельная сессия на том же сервере).
#[derive(Clone)]
pub struct MemoryChatApi {
    state: Arc<Mutex<MemoryState>>,
    caller: String,
}

impl MemoryChatApi {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            caller: caller.into(),
        }
    }

    pub fn as_user(&self, caller: impl Into<String>) -> Self {
        Self {
            state: self.state.clone(),
            caller: caller.into(),
        }
    }

    pub fn register_user(&self, id: &str, name: &str, role: Role) {
        self.lock().users.insert(
            id.to_string(),
            UserRef {
                id: id.to_string(),
                name: Some(name.to_string()),
                role: Some(role),
            },
        );
    }

    /// Создать беседу напрямую, минуя проверки
    pub fn seed_conversation(&self, a: &str, b: &str) -> String {
        self.lock().insert_conversation(a, b)
    }

    /// Следующий `send_message` завершится этой ошибкой
    pub fn fail_next_send(&self, error: ChatError) {
        self.lock().pending_failures.push_back(error);
    }

    /// Следующие `count` созданий беседы проиграют гонку (duplicate key)
    pub fn race_next_creates(&self, count: u32) {
        self.lock().create_races = count;
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find_or_create(&self, recipient_id: &str) -> Result<Conversation> {
        let mut state = self.lock();
        if recipient_id == self.caller {
            return Err(ChatError::InvalidInput(
                "Cannot start a conversation with yourself".to_string(),
            ));
        }
        if !state.users.contains_key(recipient_id) {
            return Err(ChatError::NotFound(format!("User {} not found", recipient_id)));
        }

        if state.create_races > 0 {
            state.create_races -= 1;
            // Параллельный запрос успел создать беседу первым
            if state.find_pair(&self.caller, recipient_id).is_none() {
                state.insert_conversation(&self.caller, recipient_id);
            }
            return Err(ChatError::DuplicateCreate);
        }

        if state.find_pair(&self.caller, recipient_id).is_none() {
            state.insert_conversation(&self.caller, recipient_id);
        }
        let stored = state
            .find_pair(&self.caller, recipient_id)
            .ok_or_else(|| ChatError::PersistenceFailure("conversation vanished".to_string()))?;
        Ok(state.view(stored, &self.caller))
    }
}

#[async_trait]
impl ChatApi for MemoryChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let state = self.lock();
        let mut conversations: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| c.has(&self.caller))
            .map(|c| state.view(c, &self.caller))
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn list_conversations_with(&self, counterpart: &Counterpart) -> Result<Vec<Conversation>> {
        let state = self.lock();
        let mut conversations: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| c.has(&self.caller))
            .filter(|c| {
                let other = c.other(&self.caller);
                match counterpart {
                    Counterpart::User(id) => other == id,
                    Counterpart::Admin => state.user(other).role == Some(Role::Admin),
                }
            })
            .map(|c| state.view(c, &self.caller))
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn create_conversation(&self, recipient_id: &str) -> Result<Conversation> {
        self.find_or_create(recipient_id)
    }

    async fn conversation_with(&self, user_id: &str) -> Result<Conversation> {
        self.find_or_create(user_id)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut state = self.lock();
        if !state.conversation(conversation_id)?.has(&self.caller) {
            return Err(ChatError::Forbidden(format!(
                "{} is not a participant of {}",
                self.caller, conversation_id
            )));
        }

        let caller = self.caller.clone();
        let mut messages = Vec::new();
        for stored in state
            .messages
            .iter_mut()
            .filter(|m| m.message.conversation_id == conversation_id)
        {
            // Сервер помечает прочитанным при чтении
            stored.read_by.insert(caller.clone());
            messages.push(stored.message.clone());
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn send_message(&self, conversation_id: &str, body: &SendMessageData) -> Result<Message> {
        let mut state = self.lock();
        if let Some(error) = state.pending_failures.pop_front() {
            return Err(error);
        }

        if !state.conversation(conversation_id)?.has(&self.caller) {
            return Err(ChatError::Forbidden(format!(
                "{} is not a participant of {}",
                self.caller, conversation_id
            )));
        }

        validate_outgoing(Some(body.content.as_str()), body.image_base64.is_some())?;
        if let Some(image) = &body.image_base64 {
            // Сервер принимает только inline data URL
            b64::from_data_url(image).map_err(ChatError::InvalidInput)?;
        }
        let content = Some(body.content.clone()).filter(|c| !c.is_empty());
        let body = MessageBody::from_parts(content, body.image_base64.clone())
            .ok_or_else(|| ChatError::InvalidInput("Empty message".to_string()))?;

        let message = Message {
            id: uuid::Uuid::new_v4().simple().to_string(),
            conversation_id: conversation_id.to_string(),
            sender: state.user(&self.caller),
            body,
            created_at: Utc::now(),
        };

        if let Some(stored) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            stored.last_message = Some(message.snapshot());
            stored.updated_at = message.created_at;
        }
        state.messages.push(StoredMessage {
            message: message.clone(),
            read_by: HashSet::from([self.caller.clone()]),
        });

        Ok(message)
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.user(&self.caller).role != Some(Role::Admin) {
            return Err(ChatError::Forbidden(
                "Only administrators can delete messages".to_string(),
            ));
        }

        let before = state.messages.len();
        state.messages.retain(|m| m.message.id != message_id);
        if state.messages.len() == before {
            return Err(ChatError::NotFound(format!("Message {} not found", message_id)));
        }
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64> {
        let state = self.lock();
        let total = state
            .conversations
            .iter()
            .filter(|c| c.has(&self.caller))
            .map(|c| state.unread_for(&c.id, &self.caller) as u64)
            .sum();
        Ok(total)
    }
}
