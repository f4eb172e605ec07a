use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Who authored a message. `System` only ever appears in outgoing transcripts.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow::anyhow!("Unknown message role: {}", other)),
        }
    }
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub app_scope: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// Derived summary of a conversation, replaced wholesale on every derivation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatMetadata {
    pub summary: String,
    pub keywords: Vec<String>,
}

// Represents the metadata for a conversation thread
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: String,
    pub app_scope: String, // which tool created it, e.g. "neural_text"
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChatMetadata>,
}

/// Result of a classification request. Never an error: failures collapse to
/// [`Classification::fallback`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    #[serde(rename = "chat_title")]
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
}

impl Classification {
    pub fn fallback() -> Self {
        Self {
            title: "New Chat".to_string(),
            summary: "Chat started".to_string(),
            keywords: Vec::new(),
        }
    }

    pub fn into_metadata(self) -> ChatMetadata {
        ChatMetadata {
            summary: self.summary,
            keywords: self.keywords,
        }
    }
}

/// Supported inference backends. All of them speak the OpenAI chat-completions dialect.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    OpenRouter,
    Ollama,
    LmStudio,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::OpenRouter,
        Provider::Ollama,
        Provider::LmStudio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::OpenRouter => "openrouter",
            Provider::Ollama => "ollama",
            Provider::LmStudio => "lmstudio",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LmStudio => "http://localhost:1234/v1",
        }
    }

    pub fn chat_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::OpenRouter => "nvidia/llama-3.1-nemotron-70b-instruct:free",
            Provider::Ollama => "llama3.2",
            Provider::LmStudio => "deepseek-r1-distill-qwen-14b",
        }
    }

    /// Model used for the structured title/summary/keywords request.
    pub fn classification_model(self) -> &'static str {
        match self {
            Provider::OpenRouter => "google/learnlm-1.5-pro-experimental:free",
            other => other.chat_model(),
        }
    }

    /// Hosted providers need a bearer key; local servers do not.
    pub fn requires_api_key(self) -> bool {
        matches!(self, Provider::OpenAi | Provider::OpenRouter)
    }

    pub fn extra_headers(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Provider::OpenRouter => &[
                ("HTTP-Referer", "https://pluto.local"),
                ("X-Title", "Pluto AI Platform"),
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", s))
    }
}

// One record per user: the selected backend plus its credential/endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProviderConfig {
    pub id: Uuid,
    pub user_id: String,
    pub provider: Option<Provider>,
    #[serde(skip_serializing)] // never leaves the process
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    /// Non-empty API key, if any.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Non-empty endpoint override, if any.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
}
