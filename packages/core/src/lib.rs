// Support Chat Core
// Синхронизация чата продавец <-> администратор поверх REST и push-канала

#![warn(clippy::all)]

// Модули
pub mod api;
pub mod config;
pub mod protocol;
pub mod storage;
pub mod state;
pub mod utils;
pub mod error;

// Re-exports для удобства
pub use api::{ChatApi, Counterpart, DeliveryPipeline, Draft, HttpChatApi, ImageAttachment, SendFailure};
pub use config::Config;
pub use error::{ChatError, Result};
pub use protocol::transport::{MemoryTransport, PushTransport, WsTransport};
pub use state::{ChatClient, ConnectionManager, ConnectionState, ConnectionStatus, Role, Session, UiStatus};
pub use storage::models::{Conversation, Message, MessageBody, UserRef};
pub use storage::MemoryChatApi;
