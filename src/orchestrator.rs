//! Conversation turns: persist the user's message, ask the provider, persist the reply.
//!
//! Every entry point resolves the signed-in user first and only touches conversations
//! that user owns. A conversation runs at most one turn at a time.

use crate::api::{ChatTurn, InferenceTarget};
use crate::error::{ChatError, InferenceError};
use crate::models::{Classification, Conversation, Message, Provider, ProviderConfig, Role, User};
use crate::state::{AppState, ChatEvent, GenerationGuard, GenerationPhase};
use futures::StreamExt;
use std::future::Future;
use uuid::Uuid;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

pub const FALLBACK_REPLY: &str = "Sorry, there was an error communicating with the inference provider. Please check your settings and try again.";

pub const CONFIGURE_PROVIDER_REPLY: &str =
    "Please configure an inference provider in Settings to use this feature.";

/// Both records written by a successful [`submit`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
}

async fn require_user(state: &AppState) -> Result<User, ChatError> {
    state
        .identity
        .current_user()
        .await
        .ok_or(ChatError::NotAuthenticated)
}

async fn owned_conversation(
    state: &AppState,
    user: &User,
    conversation_id: Uuid,
) -> Result<Conversation, ChatError> {
    let conversation = state
        .storage
        .lock()
        .await
        .get_conversation(conversation_id)
        .await?;
    match conversation {
        Some(c) if c.user_id == user.id => Ok(c),
        _ => Err(ChatError::ConversationNotFound(conversation_id)),
    }
}

/// System prompt, then the stored history in order, then `user_text`.
pub fn build_transcript(system_prompt: &str, history: &[Message], user_text: &str) -> Vec<ChatTurn> {
    let mut transcript = Vec::with_capacity(history.len() + 2);
    transcript.push(ChatTurn::system(system_prompt));
    transcript.extend(history.iter().map(|m| ChatTurn {
        role: m.role,
        content: m.content.clone(),
    }));
    transcript.push(ChatTurn::user(user_text));
    transcript
}

fn fallback_text(err: &InferenceError) -> &'static str {
    if err.is_credential_missing() {
        CONFIGURE_PROVIDER_REPLY
    } else {
        FALLBACK_REPLY
    }
}

async fn until_cancelled<T>(
    guard: &GenerationGuard,
    request: impl Future<Output = Result<T, InferenceError>>,
) -> Result<T, InferenceError> {
    tokio::select! {
        _ = guard.cancelled() => Err(InferenceError::Cancelled),
        result = request => result,
    }
}

/// Runs one completion, keeping the generation phase and the streaming projection
/// current. Returns the whole reply text.
async fn generate(
    state: &AppState,
    guard: &GenerationGuard,
    conversation: &Conversation,
    provider_config: Option<&ProviderConfig>,
    transcript: &[ChatTurn],
    streaming: bool,
) -> Result<String, InferenceError> {
    let target = InferenceTarget::from_config(provider_config)?;
    let conversation_id = conversation.id;

    if !streaming {
        log::info!("Requesting completion for conversation {}", conversation_id);
        let reply = until_cancelled(
            guard,
            state.api_provider.send_chat_request(&target, transcript),
        )
        .await?;
        guard.set_phase(GenerationPhase::Completing);
        return Ok(reply);
    }

    log::info!("Starting stream request for conversation {}", conversation_id);
    let mut delta_stream = until_cancelled(
        guard,
        state.api_provider.send_chat_stream_request(&target, transcript),
    )
    .await?;
    guard.start_streaming(&conversation.user_id, &conversation.app_scope);

    let mut full_content = String::new();
    let mut first_chunk = true;
    loop {
        let next = tokio::select! {
            _ = guard.cancelled() => None,
            next = delta_stream.next() => Some(next),
        };
        let delta = match next {
            None => {
                log::warn!("Stream for conversation {} abandoned", conversation_id);
                return Err(InferenceError::Cancelled);
            }
            Some(None) => break,
            Some(Some(delta)) => delta?,
        };
        if guard.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }

        full_content.push_str(&delta);
        guard.push_delta(&delta);
        state.emit(ChatEvent::AssistantChunk {
            conversation_id,
            delta,
            is_first_chunk: first_chunk,
        });
        first_chunk = false;
    }
    guard.set_phase(GenerationPhase::Completing);

    log::info!(
        "Stream for conversation {} finished ({} chars)",
        conversation_id,
        full_content.len()
    );
    Ok(full_content)
}

/// Classifies the opening message in the background and stores the result as the
/// conversation's metadata. The title is left alone.
fn spawn_classification(
    state: &AppState,
    conversation_id: Uuid,
    provider_config: Option<&ProviderConfig>,
    content: &str,
) {
    let target = InferenceTarget::from_config(provider_config);
    let state = state.clone();
    let content = content.to_string();

    tokio::spawn(async move {
        let classification = match target {
            Ok(target) => state.api_provider.classify(&target, &content).await,
            Err(e) => {
                log::debug!("Skipping classification request: {}", e);
                Classification::fallback()
            }
        };
        let metadata = classification.into_metadata();

        let result = state
            .storage
            .lock()
            .await
            .set_conversation_metadata(conversation_id, &metadata)
            .await;
        match result {
            Ok(()) => state.emit(ChatEvent::MetadataUpdated { conversation_id }),
            Err(e) => log::error!(
                "Failed to store metadata for conversation {}: {:?}",
                conversation_id,
                e
            ),
        }
    });
}

/// Sends `text` as the next user turn of `conversation_id` and stores the reply.
///
/// Rejected without writing anything when the text is blank, nobody is signed in,
/// the conversation is unknown, no provider is selected, or a turn is already running.
/// Inference failures don't fail the call: a fallback reply is stored instead.
pub async fn submit(
    state: &AppState,
    conversation_id: Uuid,
    text: &str,
    streaming: bool,
) -> Result<TurnOutcome, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::EmptyInput);
    }
    let user = require_user(state).await?;
    let conversation = owned_conversation(state, &user, conversation_id).await?;
    let guard = state.begin_generation(conversation_id)?;

    let (provider_config, history, user_message) = {
        let storage = state.storage.lock().await;
        let provider_config = storage.get_provider_config(&user.id).await?;
        if provider_config.as_ref().and_then(|c| c.provider).is_none() {
            return Err(ChatError::NoProviderConfigured);
        }
        let history = storage.get_conversation_messages(conversation_id).await?;
        let user_message = storage
            .append_message(
                conversation_id,
                &conversation.user_id,
                &conversation.app_scope,
                text,
                Role::User,
            )
            .await?;
        (provider_config, history, user_message)
    };
    log::info!("User message {} saved.", user_message.id);

    if history.is_empty() {
        spawn_classification(state, conversation_id, provider_config.as_ref(), text);
    }

    let transcript = build_transcript(&state.config.system_prompt, &history, text);
    let content = match generate(
        state,
        &guard,
        &conversation,
        provider_config.as_ref(),
        &transcript,
        streaming,
    )
    .await
    {
        Ok(reply) => reply,
        Err(InferenceError::Cancelled) => return Err(ChatError::Cancelled(conversation_id)),
        Err(e) => {
            log::error!("Inference failed for conversation {}: {}", conversation_id, e);
            guard.set_phase(GenerationPhase::Errored);
            fallback_text(&e).to_string()
        }
    };

    let assistant_message = state
        .storage
        .lock()
        .await
        .append_message(
            conversation_id,
            &conversation.user_id,
            &conversation.app_scope,
            &content,
            Role::Assistant,
        )
        .await?;
    drop(guard);

    state.emit(ChatEvent::AssistantFinished {
        conversation_id,
        message_id: assistant_message.id,
    });
    Ok(TurnOutcome {
        user_message,
        assistant_message,
    })
}

/// Asks again for the answer to the last user message and overwrites the latest
/// assistant message with it. The message keeps its id and stays last.
pub async fn regenerate(state: &AppState, conversation_id: Uuid) -> Result<Message, ChatError> {
    let user = require_user(state).await?;
    let conversation = owned_conversation(state, &user, conversation_id).await?;
    let guard = state.begin_generation(conversation_id)?;

    let (messages, provider_config) = {
        let storage = state.storage.lock().await;
        (
            storage.get_conversation_messages(conversation_id).await?,
            storage.get_provider_config(&user.id).await?,
        )
    };

    let target_message = match messages.last() {
        Some(last) if last.role == Role::Assistant => last.clone(),
        _ => return Err(ChatError::NothingToRegenerate(conversation_id)),
    };
    let Some(last_user_idx) = messages.iter().rposition(Message::is_user) else {
        return Err(ChatError::NothingToRegenerate(conversation_id));
    };
    let last_user_text = messages[last_user_idx].content.clone();

    let content = if provider_config.as_ref().and_then(|c| c.provider).is_none() {
        log::warn!("Regenerate requested without a provider for {}", conversation_id);
        CONFIGURE_PROVIDER_REPLY.to_string()
    } else {
        let transcript = build_transcript(
            &state.config.system_prompt,
            &messages[..last_user_idx],
            &last_user_text,
        );
        match generate(
            state,
            &guard,
            &conversation,
            provider_config.as_ref(),
            &transcript,
            true,
        )
        .await
        {
            Ok(reply) => reply,
            Err(InferenceError::Cancelled) => return Err(ChatError::Cancelled(conversation_id)),
            Err(e) => {
                log::error!("Regeneration failed for conversation {}: {}", conversation_id, e);
                guard.set_phase(GenerationPhase::Errored);
                fallback_text(&e).to_string()
            }
        }
    };

    let updated = state
        .storage
        .lock()
        .await
        .update_message_content(target_message.id, &content)
        .await?
        .ok_or(ChatError::NothingToRegenerate(conversation_id))?;
    drop(guard);

    state.emit(ChatEvent::AssistantFinished {
        conversation_id,
        message_id: updated.id,
    });
    Ok(updated)
}

// --- Conversations ---

pub async fn list_conversations(
    state: &AppState,
    app_scope: &str,
) -> Result<Vec<Conversation>, ChatError> {
    let user = require_user(state).await?;
    let conversations = state
        .storage
        .lock()
        .await
        .list_conversations(&user.id, app_scope)
        .await?;
    Ok(conversations)
}

pub async fn create_conversation(
    state: &AppState,
    app_scope: &str,
    title: Option<&str>,
) -> Result<Conversation, ChatError> {
    let user = require_user(state).await?;
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_CONVERSATION_TITLE);
    let conversation = state
        .storage
        .lock()
        .await
        .create_conversation(&user.id, app_scope, title)
        .await?;
    Ok(conversation)
}

/// The most recently touched conversation in `app_scope`, or a fresh one if there is none.
pub async fn open_latest_conversation(
    state: &AppState,
    app_scope: &str,
) -> Result<Conversation, ChatError> {
    let conversations = list_conversations(state, app_scope).await?;
    match conversations.into_iter().next() {
        Some(latest) => Ok(latest),
        None => create_conversation(state, app_scope, None).await,
    }
}

pub async fn get_conversation_messages(
    state: &AppState,
    conversation_id: Uuid,
) -> Result<Vec<Message>, ChatError> {
    let user = require_user(state).await?;
    owned_conversation(state, &user, conversation_id).await?;
    let messages = state
        .storage
        .lock()
        .await
        .get_conversation_messages(conversation_id)
        .await?;
    Ok(messages)
}

pub async fn rename_conversation(
    state: &AppState,
    conversation_id: Uuid,
    new_title: &str,
) -> Result<(), ChatError> {
    let new_title = new_title.trim();
    if new_title.is_empty() {
        return Err(ChatError::EmptyInput);
    }
    let user = require_user(state).await?;
    owned_conversation(state, &user, conversation_id).await?;
    state
        .storage
        .lock()
        .await
        .rename_conversation(conversation_id, new_title)
        .await?;
    Ok(())
}

/// Deletes the conversation and its messages, abandoning any turn still running.
pub async fn delete_conversation(state: &AppState, conversation_id: Uuid) -> Result<(), ChatError> {
    let user = require_user(state).await?;
    owned_conversation(state, &user, conversation_id).await?;
    state.abandon(conversation_id);
    state
        .storage
        .lock()
        .await
        .delete_conversation(conversation_id)
        .await?;
    Ok(())
}

// --- Provider settings ---

pub async fn get_provider_config(state: &AppState) -> Result<Option<ProviderConfig>, ChatError> {
    let user = require_user(state).await?;
    let config = state
        .storage
        .lock()
        .await
        .get_provider_config(&user.id)
        .await?;
    Ok(config)
}

pub async fn save_provider_config(
    state: &AppState,
    provider: Option<Provider>,
    api_key: Option<String>,
    base_url: Option<String>,
) -> Result<ProviderConfig, ChatError> {
    let user = require_user(state).await?;
    let config = state
        .storage
        .lock()
        .await
        .save_provider_config(&user.id, provider, api_key, base_url)
        .await?;
    Ok(config)
}

pub async fn switch_provider(
    state: &AppState,
    provider: Option<Provider>,
) -> Result<ProviderConfig, ChatError> {
    let user = require_user(state).await?;
    let config = state
        .storage
        .lock()
        .await
        .switch_provider(&user.id, provider)
        .await?;
    Ok(config)
}

pub async fn clear_provider_credential(state: &AppState) -> Result<(), ChatError> {
    let user = require_user(state).await?;
    state
        .storage
        .lock()
        .await
        .clear_provider_credential(&user.id)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            user_id: "u1".into(),
            app_scope: "neural_text".into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn transcript_is_system_history_then_new_turn() {
        let history = vec![message(Role::User, "Hello"), message(Role::Assistant, "Hi there")];
        let transcript = build_transcript("Be nice.", &history, "How are you?");
        assert_eq!(
            transcript,
            vec![
                ChatTurn::system("Be nice."),
                ChatTurn::user("Hello"),
                ChatTurn::assistant("Hi there"),
                ChatTurn::user("How are you?"),
            ]
        );
    }

    #[test]
    fn missing_credentials_get_the_settings_hint() {
        let missing = InferenceError::CredentialMissing("no key".into());
        assert_eq!(fallback_text(&missing), CONFIGURE_PROVIDER_REPLY);
        assert_eq!(fallback_text(&InferenceError::transport("boom")), FALLBACK_REPLY);
    }
}
