use crate::api::LLMApiProvider;
use crate::auth::IdentityProvider;
use crate::config::AppConfig;
use crate::error::ChatError;
use crate::models::{Message, Role};
use crate::storage::StorageManager;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Where a conversation's current turn is. No entry in the generation map means `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPhase {
    Idle,
    Sending,
    Streaming,
    Completing,
    Errored,
}

/// Notifications for whatever front end is attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    AssistantChunk {
        conversation_id: Uuid,
        delta: String,
        is_first_chunk: bool,
    },
    AssistantFinished {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    MetadataUpdated {
        conversation_id: Uuid,
    },
}

pub struct Generation {
    pub phase: GenerationPhase,
    /// The assistant reply as received so far. Its id is nil; it is never stored.
    pub streaming: Option<Message>,
    cancelled: Arc<AtomicBool>,
    cancel: Arc<Notify>,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Mutex<StorageManager>>,
    pub api_provider: Arc<dyn LLMApiProvider>,
    pub identity: Arc<dyn IdentityProvider>,
    pub config: Arc<AppConfig>,
    pub generations: Arc<DashMap<Uuid, Generation>>, // keyed by conversation id
    events: broadcast::Sender<ChatEvent>,
}

impl AppState {
    pub fn new(
        storage_manager: StorageManager,
        api_provider: Arc<dyn LLMApiProvider>,
        identity: Arc<dyn IdentityProvider>,
        config: AppConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage: Arc::new(Mutex::new(storage_manager)),
            api_provider,
            identity,
            config: Arc::new(config),
            generations: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn phase(&self, conversation_id: Uuid) -> GenerationPhase {
        self.generations
            .get(&conversation_id)
            .map(|g| g.phase)
            .unwrap_or(GenerationPhase::Idle)
    }

    pub fn streaming_message(&self, conversation_id: Uuid) -> Option<Message> {
        self.generations
            .get(&conversation_id)
            .and_then(|g| g.streaming.clone())
    }

    /// Stops reading the in-flight reply for `conversation_id`. Whatever arrived so far
    /// is thrown away. Returns false when nothing was in flight.
    pub fn abandon(&self, conversation_id: Uuid) -> bool {
        match self.generations.get(&conversation_id) {
            Some(generation) => {
                log::warn!("Abandoning generation for conversation {}", conversation_id);
                generation.cancelled.store(true, Ordering::SeqCst);
                generation.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Claims the conversation for one turn. Fails if a turn is already running.
    pub(crate) fn begin_generation(
        &self,
        conversation_id: Uuid,
    ) -> Result<GenerationGuard, ChatError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(Notify::new());
        match self.generations.entry(conversation_id) {
            Entry::Occupied(_) => {
                log::warn!("Rejecting request: conversation {} is busy", conversation_id);
                return Err(ChatError::GenerationInFlight(conversation_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Generation {
                    phase: GenerationPhase::Sending,
                    streaming: None,
                    cancelled: cancelled.clone(),
                    cancel: cancel.clone(),
                });
            }
        }
        Ok(GenerationGuard {
            generations: self.generations.clone(),
            conversation_id,
            cancelled,
            cancel,
        })
    }
}

/// Holds a conversation's slot in the generation map. Dropping it returns the
/// conversation to `Idle`, however the turn ended.
pub(crate) struct GenerationGuard {
    generations: Arc<DashMap<Uuid, Generation>>,
    conversation_id: Uuid,
    cancelled: Arc<AtomicBool>,
    cancel: Arc<Notify>,
}

impl GenerationGuard {
    pub fn set_phase(&self, phase: GenerationPhase) {
        if let Some(mut generation) = self.generations.get_mut(&self.conversation_id) {
            generation.phase = phase;
        }
    }

    pub fn start_streaming(&self, user_id: &str, app_scope: &str) {
        if let Some(mut generation) = self.generations.get_mut(&self.conversation_id) {
            generation.phase = GenerationPhase::Streaming;
            generation.streaming = Some(Message {
                id: Uuid::nil(),
                conversation_id: self.conversation_id,
                user_id: user_id.to_string(),
                app_scope: app_scope.to_string(),
                role: Role::Assistant,
                content: String::new(),
                timestamp: Utc::now(),
            });
        }
    }

    pub fn push_delta(&self, delta: &str) {
        if let Some(mut generation) = self.generations.get_mut(&self.conversation_id) {
            if let Some(message) = generation.streaming.as_mut() {
                message.content.push_str(delta);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`AppState::abandon`] is called for this conversation.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.cancel.notified().await;
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.generations.remove(&self.conversation_id);
    }
}
