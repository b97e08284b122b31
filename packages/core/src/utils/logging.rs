// Логирование

use tracing_subscriber::{fmt, EnvFilter};

/// Установить глобальный tracing subscriber.
///
/// Фильтр берётся из `RUST_LOG`, по умолчанию `info`. Повторный вызов
/// ничего не делает (subscriber уже установлен хостом или тестом).
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tokio_tungstenite=warn,reqwest=warn"));

    let _ = fmt().with_env_filter(env_filter).with_target(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!("logging initialized");
    }
}
