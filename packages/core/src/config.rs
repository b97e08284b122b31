//! Централизованная конфигурация для support chat core
//!
//! Все константы синхронизации (переподключение, debounce набора текста,
//! повтор создания беседы) определены здесь, чтобы избежать хардкода.

use std::sync::OnceLock;
use std::time::Duration;

/// Глобальная конфигурация приложения (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Основная структура конфигурации
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // ============================================
    // ENDPOINTS
    // ============================================

    /// Базовый URL REST API (без завершающего `/`)
    pub api_base_url: String,

    /// URL push-канала (WebSocket)
    pub push_url: String,

    /// Таймаут одного REST запроса (в миллисекундах)
    pub request_timeout_ms: u64,

    // ============================================
    // ПЕРЕПОДКЛЮЧЕНИЕ
    // ============================================

    /// Задержка перед повторной попыткой подключения (в миллисекундах)
    pub reconnect_delay_ms: u64,

    /// Потолок задержки (в миллисекундах)
    pub reconnect_delay_max_ms: u64,

    /// Множитель задержки между попытками. 1 = фиксированная задержка
    pub reconnect_backoff_multiplier: u64,

    /// Максимальное количество подряд идущих повторных попыток
    pub reconnect_max_attempts: u32,

    /// Ёмкость broadcast-канала входящих событий
    pub event_channel_capacity: usize,

    // ============================================
    // НАБОР ТЕКСТА
    // ============================================

    /// Период тишины, после которого отправляется stop_typing (в миллисекундах)
    pub typing_quiet_period_ms: u64,

    /// Сброс флага "собеседник печатает" без stop_typing (в миллисекундах).
    /// 0 = не сбрасывать
    pub remote_typing_timeout_ms: u64,

    // ============================================
    // REST
    // ============================================

    /// Пауза перед повторным запросом беседы после duplicate key (в миллисекундах)
    pub duplicate_create_retry_delay_ms: u64,
}

impl Config {
    /// Создать конфигурацию с дефолтными значениями
    pub fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            push_url: "ws://localhost:5000/ws".to_string(),
            request_timeout_ms: 15_000,

            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 5000,
            reconnect_backoff_multiplier: 1,
            reconnect_max_attempts: 5,
            event_channel_capacity: 256,

            typing_quiet_period_ms: 2000,
            remote_typing_timeout_ms: 0,

            duplicate_create_retry_delay_ms: 500,
        }
    }

    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CHAT_API_BASE_URL") {
            config.api_base_url = val.trim_end_matches('/').to_string();
        }

        if let Ok(val) = std::env::var("CHAT_PUSH_URL") {
            config.push_url = val;
        }

        override_parsed("CHAT_REQUEST_TIMEOUT_MS", &mut config.request_timeout_ms);
        override_parsed("CHAT_RECONNECT_DELAY_MS", &mut config.reconnect_delay_ms);
        override_parsed("CHAT_RECONNECT_DELAY_MAX_MS", &mut config.reconnect_delay_max_ms);
        override_parsed("CHAT_RECONNECT_MAX_ATTEMPTS", &mut config.reconnect_max_attempts);
        override_parsed("CHAT_TYPING_QUIET_PERIOD_MS", &mut config.typing_quiet_period_ms);
        override_parsed("CHAT_REMOTE_TYPING_TIMEOUT_MS", &mut config.remote_typing_timeout_ms);

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_period_ms)
    }

    pub fn remote_typing_timeout(&self) -> Option<Duration> {
        (self.remote_typing_timeout_ms > 0)
            .then(|| Duration::from_millis(self.remote_typing_timeout_ms))
    }

    pub fn duplicate_create_retry_delay(&self) -> Duration {
        Duration::from_millis(self.duplicate_create_retry_delay_ms)
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG
            .set(config)
            .map_err(|_| "Config already initialized")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::default()
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring unparsable {}={}", var, val),
        }
    }
}
