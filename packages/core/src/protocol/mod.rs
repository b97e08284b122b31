// Контракт push-канала и REST: DTO, кодек фреймов, валидация, транспорт

pub mod messages;
pub mod transport;
pub mod validation;
pub mod wire;
