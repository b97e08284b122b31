// HTTP реализация ChatApi поверх reqwest

use crate::api::{ChatApi, Counterpart};
use crate::config::Config;
use crate::protocol::messages::{
    ConversationData, CreateConversationData, MessageData, SendMessageData, UnreadCountData,
};
use crate::protocol::validation::validate_path_id;
use crate::state::session::Session;
use crate::storage::models::{Conversation, Message};
use crate::utils::error::{ChatError, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

/// Ответ сервера: голое значение или обёртка `{ "data": ... }`
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(value) => value,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "error")]
    message: Option<String>,
}

/// REST клиент, привязанный к одной сессии
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    bearer: String,
}

impl HttpChatApi {
    pub fn new(config: &Config, session: &Session) -> Result<Self> {
        let bearer = session.bearer()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            bearer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(reqwest::header::AUTHORIZATION, &self.bearer)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorized(request).send().await?;
        let response = check_status(response).await?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.into_inner())
    }

    async fn conversations(&self, path: &str) -> Result<Vec<Conversation>> {
        let data: Vec<ConversationData> = self.execute(self.client.get(self.url(path))).await?;
        Ok(data.into_iter().map(Conversation::from).collect())
    }
}

/// Перевести HTTP статус в таксономию ошибок
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| text.clone());
    debug!("Chat API error {}: {}", status, detail);

    Err(classify_failure(status, &detail))
}

fn classify_failure(status: StatusCode, detail: &str) -> ChatError {
    let duplicate = detail.contains("E11000") || detail.to_lowercase().contains("duplicate key");
    match status {
        StatusCode::UNAUTHORIZED => ChatError::AuthMissing,
        StatusCode::FORBIDDEN => ChatError::Forbidden(detail.to_string()),
        StatusCode::NOT_FOUND => ChatError::NotFound(detail.to_string()),
        StatusCode::CONFLICT => ChatError::DuplicateCreate,
        _ if duplicate => ChatError::DuplicateCreate,
        _ => ChatError::PersistenceFailure(format!("HTTP {}: {}", status.as_u16(), detail)),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.conversations("/chat/conversations").await
    }

    async fn list_conversations_with(&self, counterpart: &Counterpart) -> Result<Vec<Conversation>> {
        validate_path_id(counterpart.path_segment())?;
        self.conversations(&format!("/chat/conversations/user/{}", counterpart.path_segment()))
            .await
    }

    async fn create_conversation(&self, recipient_id: &str) -> Result<Conversation> {
        let body = CreateConversationData {
            recipient_id: recipient_id.to_string(),
        };
        let data: ConversationData = self
            .execute(self.client.post(self.url("/chat/conversations")).json(&body))
            .await?;
        Ok(data.into())
    }

    async fn conversation_with(&self, user_id: &str) -> Result<Conversation> {
        validate_path_id(user_id)?;
        let data: ConversationData = self
            .execute(self.client.get(self.url(&format!("/chat/conversations/with/{}", user_id))))
            .await?;
        Ok(data.into())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        validate_path_id(conversation_id)?;
        let data: Vec<MessageData> = self
            .execute(self.client.get(self.url(&format!(
                "/chat/conversations/{}/messages",
                conversation_id
            ))))
            .await?;

        Ok(data
            .into_iter()
            .filter_map(|raw| match Message::try_from(raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping malformed message: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn send_message(&self, conversation_id: &str, body: &SendMessageData) -> Result<Message> {
        validate_path_id(conversation_id)?;
        let data: MessageData = self
            .execute(
                self.client
                    .post(self.url(&format!("/chat/conversations/{}/messages", conversation_id)))
                    .json(body),
            )
            .await?;

        Message::try_from(data).map_err(|e| ChatError::SerializationError(e.to_string()))
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        validate_path_id(message_id)?;
        let request = self
            .client
            .delete(self.url(&format!("/chat/messages/{}", message_id)));
        let response = self.authorized(request).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64> {
        let data: UnreadCountData = self
            .execute(self.client.get(self.url("/chat/messages/unread")))
            .await?;
        Ok(data.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure(StatusCode::FORBIDDEN, "not a participant"),
            ChatError::Forbidden("not a participant".into())
        );
        assert_eq!(
            classify_failure(StatusCode::NOT_FOUND, "gone"),
            ChatError::NotFound("gone".into())
        );
        assert_eq!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "E11000 duplicate key error"),
            ChatError::DuplicateCreate
        );
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, "upstream"),
            ChatError::PersistenceFailure(_)
        ));
    }

    #[test]
    fn test_envelope_accepts_both_shapes() {
        let bare: Envelope<UnreadCountData> = serde_json::from_str(r#"{"count": 3}"#).unwrap();
        assert_eq!(bare.into_inner().count, 3);

        let wrapped: Envelope<UnreadCountData> =
            serde_json::from_str(r#"{"data": {"count": 4}}"#).unwrap();
        assert_eq!(wrapped.into_inner().count, 4);
    }
}
