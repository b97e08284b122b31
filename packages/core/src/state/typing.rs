// Координация индикатора набора текста
//
// Локальная дорожка: Idle -> Typing на первое нажатие, stop_typing после
// периода тишины. Удалённая дорожка: флаг "собеседник печатает".

use crate::config::Config;
use crate::protocol::messages::{ClientEvent, TypingData};
use crate::state::connection::EventSink;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Таймер, отменяемый при drop
pub struct ScopedTimer(JoinHandle<()>);

impl ScopedTimer {
    /// Запустить таймер на заданном runtime (вызывающий поток может быть вне него)
    pub fn spawn<F>(runtime: &Handle, delay: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_expiry();
        }))
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default)]
struct LocalTrack {
    typing: bool,
    /// Номер последнего нажатия; устаревший таймер не срабатывает
    generation: u64,
}

/// Состояние набора текста для одной беседы
pub struct TypingState {
    conversation_id: String,
    recipient_id: String,
    local: Arc<Mutex<LocalTrack>>,
    stop_timer: Option<ScopedTimer>,
    remote_typing: bool,
    remote_since: Option<Instant>,
}

impl TypingState {
    fn new(conversation_id: &str, recipient_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            recipient_id: recipient_id.to_string(),
            local: Arc::new(Mutex::new(LocalTrack::default())),
            stop_timer: None,
            remote_typing: false,
            remote_since: None,
        }
    }
}

fn lock(track: &Mutex<LocalTrack>) -> std::sync::MutexGuard<'_, LocalTrack> {
    track.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn signal(conversation_id: &str, user_id: &str, recipient_id: &str) -> TypingData {
    TypingData {
        conversation_id: conversation_id.to_string(),
        user_id: user_id.to_string(),
        recipient_id: Some(recipient_id.to_string()),
    }
}

/// Координатор набора текста для активной беседы
pub struct TypingCoordinator {
    local_user_id: String,
    quiet_period: Duration,
    remote_timeout: Option<Duration>,
    sink: Arc<dyn EventSink>,
    /// Runtime, на котором создан координатор
    runtime: Option<Handle>,
    active: Option<TypingState>,
}

impl TypingCoordinator {
    pub fn new(local_user_id: impl Into<String>, sink: Arc<dyn EventSink>, config: &Config) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            quiet_period: config.typing_quiet_period(),
            remote_timeout: config.remote_typing_timeout(),
            sink,
            runtime: Handle::try_current().ok(),
            active: None,
        }
    }

    /// Явно задать runtime для таймеров тишины
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Начать отслеживание беседы; состояние предыдущей освобождается
    pub fn activate(&mut self, conversation_id: &str, recipient_id: &str) {
        self.release();
        self.active = Some(TypingState::new(conversation_id, recipient_id));
    }

    /// Освободить состояние: отменить таймер и, если пользователь
    /// печатал, отправить stop_typing
    pub fn release(&mut self) {
        let Some(mut state) = self.active.take() else {
            return;
        };
        state.stop_timer = None;

        let was_typing = std::mem::take(&mut lock(&state.local).typing);
        if was_typing {
            self.sink.emit(ClientEvent::StopTyping(signal(
                &state.conversation_id,
                &self.local_user_id,
                &state.recipient_id,
            )));
        }
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.conversation_id.as_str())
    }

    /// Нажатие клавиши в поле ввода активной беседы
    pub fn keystroke(&mut self) {
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!("No tokio runtime for the typing timer, ignoring keystroke");
            return;
        };
        let Some(state) = self.active.as_mut() else {
            return;
        };

        let (started, generation) = {
            let mut local = lock(&state.local);
            local.generation += 1;
            let started = !local.typing;
            local.typing = true;
            (started, local.generation)
        };

        if started {
            self.sink.emit(ClientEvent::Typing(signal(
                &state.conversation_id,
                &self.local_user_id,
                &state.recipient_id,
            )));
        }

        let local = state.local.clone();
        let sink = self.sink.clone();
        let stop = signal(&state.conversation_id, &self.local_user_id, &state.recipient_id);
        // Замена таймера отменяет предыдущий
        state.stop_timer = Some(ScopedTimer::spawn(&runtime, self.quiet_period, move || {
            let expired = {
                let mut local = lock(&local);
                let expired = local.typing && local.generation == generation;
                if expired {
                    local.typing = false;
                }
                expired
            };
            if expired {
                sink.emit(ClientEvent::StopTyping(stop));
            }
        }));
    }

    pub fn is_typing_locally(&self) -> bool {
        self.active
            .as_ref()
            .map(|state| lock(&state.local).typing)
            .unwrap_or(false)
    }

    pub fn on_remote_typing(&mut self, data: &TypingData) {
        if let Some(state) = self.remote_state(&data.conversation_id, &data.user_id) {
            state.remote_typing = true;
            state.remote_since = Some(Instant::now());
        }
    }

    pub fn on_remote_stop(&mut self, data: &TypingData) {
        if let Some(state) = self.remote_state(&data.conversation_id, &data.user_id) {
            state.remote_typing = false;
            state.remote_since = None;
        }
    }

    /// Новое сообщение от собеседника тоже снимает флаг
    pub fn on_remote_message(&mut self, conversation_id: &str, sender_id: &str) {
        if let Some(state) = self.remote_state(conversation_id, sender_id) {
            state.remote_typing = false;
            state.remote_since = None;
        }
    }

    pub fn is_remote_typing(&self) -> bool {
        let Some(state) = self.active.as_ref() else {
            return false;
        };
        match (self.remote_timeout, state.remote_since) {
            (Some(timeout), Some(since)) => state.remote_typing && since.elapsed() < timeout,
            _ => state.remote_typing,
        }
    }

    /// Состояние активной беседы, если сигнал пришёл от её собеседника
    fn remote_state(&mut self, conversation_id: &str, user_id: &str) -> Option<&mut TypingState> {
        match self.active.as_mut() {
            Some(state) if state.conversation_id == conversation_id => {
                if state.recipient_id == user_id {
                    Some(state)
                } else {
                    debug!("Ignoring typing signal from {} in {}", user_id, conversation_id);
                    None
                }
            }
            _ => {
                debug!("Ignoring typing signal for inactive conversation {}", conversation_id);
                None
            }
        }
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ClientEvent>>);

    impl RecordingSink {
        fn starts(&self) -> usize {
            self.0.lock().unwrap().iter().filter(|e| matches!(e, ClientEvent::Typing(_))).count()
        }

        fn stops(&self) -> usize {
            self.0.lock().unwrap().iter().filter(|e| matches!(e, ClientEvent::StopTyping(_))).count()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: ClientEvent) -> bool {
            self.0.lock().unwrap().push(event);
            true
        }
    }

    fn coordinator(config: &Config) -> (TypingCoordinator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut typing = TypingCoordinator::new("me", sink.clone(), config);
        typing.activate("c1", "admin");
        (typing, sink)
    }

    fn remote(user: &str) -> TypingData {
        TypingData {
            conversation_id: "c1".into(),
            user_id: user.into(),
            recipient_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_emits_single_start_and_stop() {
        let (mut typing, sink) = coordinator(&Config::default());

        for _ in 0..5 {
            typing.keystroke();
            sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(sink.starts(), 1);
        assert_eq!(sink.stops(), 0);
        assert!(typing.is_typing_locally());

        // Последнее нажатие было 500ms назад
        sleep(Duration::from_millis(1400)).await;
        assert_eq!(sink.stops(), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.stops(), 1);
        assert!(!typing.is_typing_locally());

        // Новый всплеск - новый start
        typing.keystroke();
        assert_eq!(sink.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_switch_emits_stop_once() {
        let (mut typing, sink) = coordinator(&Config::default());
        typing.keystroke();

        typing.activate("c2", "admin");
        assert_eq!(sink.stops(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.stops(), 1);
        assert_eq!(typing.active_conversation(), Some("c2"));
    }

    #[tokio::test]
    async fn test_remote_track() {
        let (mut typing, _) = coordinator(&Config::default());

        typing.on_remote_typing(&remote("admin"));
        assert!(typing.is_remote_typing());

        typing.on_remote_stop(&remote("admin"));
        assert!(!typing.is_remote_typing());

        typing.on_remote_typing(&remote("admin"));
        typing.on_remote_message("c1", "admin");
        assert!(!typing.is_remote_typing());

        // Собственное эхо и чужие беседы игнорируются
        typing.on_remote_typing(&remote("me"));
        typing.on_remote_typing(&TypingData {
            conversation_id: "c9".into(),
            user_id: "admin".into(),
            recipient_id: None,
        });
        assert!(!typing.is_remote_typing());
    }

    #[tokio::test]
    async fn test_only_counterpart_drives_remote_track() {
        let (mut typing, _) = coordinator(&Config::default());

        typing.on_remote_typing(&remote("intruder"));
        assert!(!typing.is_remote_typing());

        typing.on_remote_typing(&remote("admin"));
        typing.on_remote_stop(&remote("intruder"));
        typing.on_remote_message("c1", "intruder");
        assert!(typing.is_remote_typing());
    }

    #[test]
    fn test_keystroke_outside_runtime_uses_captured_handle() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut typing = runtime.block_on(async {
            TypingCoordinator::new("me", sink.clone(), &Config::default())
        });
        typing.activate("c1", "admin");

        // Вызов из потока без runtime-контекста
        typing.keystroke();
        assert_eq!(sink.starts(), 1);
        assert!(typing.is_typing_locally());

        runtime.block_on(async { sleep(Duration::from_secs(3)).await });
        assert_eq!(sink.stops(), 1);
        assert!(!typing.is_typing_locally());
    }

    #[test]
    fn test_keystroke_without_any_runtime_is_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let mut typing = TypingCoordinator::new("me", sink.clone(), &Config::default());
        typing.activate("c1", "admin");

        typing.keystroke();
        assert_eq!(sink.starts(), 0);
        assert!(!typing.is_typing_locally());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_safety_timeout() {
        let mut config = Config::default();
        config.remote_typing_timeout_ms = 4000;
        let (mut typing, _) = coordinator(&config);

        typing.on_remote_typing(&remote("admin"));
        sleep(Duration::from_millis(3000)).await;
        assert!(typing.is_remote_typing());

        sleep(Duration::from_millis(1500)).await;
        assert!(!typing.is_remote_typing());
    }
}
