// Модели и in-memory бэкенд

pub mod memory;
pub mod models;

pub use memory::MemoryChatApi;
