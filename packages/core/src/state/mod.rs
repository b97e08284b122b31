// Состояние клиента: сессия, подключение, беседы, сообщения, набор текста

pub mod app;
pub mod connection;
pub mod conversations;
pub mod messages;
pub mod session;
pub mod typing;

pub use app::{ChatClient, UiStatus};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus};
pub use session::{Role, Session};
