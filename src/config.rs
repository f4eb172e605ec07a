use crate::api::GenerationOptions;
use anyhow::{Context, Result};
use std::path::PathBuf;

pub const DEFAULT_APP_SCOPE: &str = "neural_text";
pub const DEFAULT_USER_ID: &str = "local-user";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Provide clear, accurate, and engaging responses.";

const ENV_DB_PATH: &str = "PLUTO_DB_PATH";
const ENV_USER_ID: &str = "PLUTO_USER_ID";
const ENV_APP_SCOPE: &str = "PLUTO_APP_SCOPE";
const ENV_SYSTEM_PROMPT: &str = "PLUTO_SYSTEM_PROMPT";
const ENV_TEMPERATURE: &str = "PLUTO_TEMPERATURE";
const ENV_MAX_TOKENS: &str = "PLUTO_MAX_TOKENS";
const ENV_STREAM: &str = "PLUTO_STREAM";

/// Process-wide settings. Provider credentials are not here; they live in the store.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub user_id: String,
    pub app_scope: String,
    pub system_prompt: String,
    pub generation: GenerationOptions,
    pub stream: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_id: DEFAULT_USER_ID.to_string(),
            app_scope: DEFAULT_APP_SCOPE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            generation: GenerationOptions::default(),
            stream: true,
        }
    }
}

impl AppConfig {
    /// Reads `PLUTO_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = var(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(user_id) = var(ENV_USER_ID) {
            config.user_id = user_id;
        }
        if let Some(scope) = var(ENV_APP_SCOPE) {
            config.app_scope = scope;
        }
        if let Some(prompt) = var(ENV_SYSTEM_PROMPT) {
            config.system_prompt = prompt;
        }
        if let Some(raw) = var(ENV_TEMPERATURE) {
            config.generation.temperature = raw.trim().parse().with_context(|| {
                format!("Invalid {} value '{}': expected a number", ENV_TEMPERATURE, raw)
            })?;
        }
        if let Some(raw) = var(ENV_MAX_TOKENS) {
            config.generation.max_tokens = match raw.trim() {
                "0" | "none" => None,
                n => Some(n.parse().with_context(|| {
                    format!("Invalid {} value '{}': expected an integer", ENV_MAX_TOKENS, raw)
                })?),
            };
        }
        if let Some(raw) = var(ENV_STREAM) {
            config.stream = parse_flag(&raw)
                .with_context(|| format!("Invalid {} value '{}'", ENV_STREAM, raw))?;
        }

        log::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got '{}'", other)),
    }
}

/// `<local data dir>/pluto-chat/pluto-chat.sqlite`, or the working directory when the
/// platform has no data dir.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pluto-chat")
        .join("pluto-chat.sqlite")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.app_scope, DEFAULT_APP_SCOPE);
        assert_eq!(config.user_id, DEFAULT_USER_ID);
        assert_eq!(config.generation, GenerationOptions::default());
        assert!(config.stream);
        assert!(config.db_path.ends_with("pluto-chat/pluto-chat.sqlite"));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PLUTO_DB_PATH", "/tmp/chat.sqlite"),
            ("PLUTO_APP_SCOPE", "code_helper"),
            ("PLUTO_TEMPERATURE", "0.2"),
            ("PLUTO_MAX_TOKENS", "none"),
            ("PLUTO_STREAM", "off"),
            ("PLUTO_USER_ID", "  "),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/chat.sqlite"));
        assert_eq!(config.app_scope, "code_helper");
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.generation.max_tokens, None);
        assert!(!config.stream);
        assert_eq!(config.user_id, DEFAULT_USER_ID);
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = AppConfig::from_lookup(lookup(&[("PLUTO_TEMPERATURE", "warm")])).unwrap_err();
        assert!(err.to_string().contains("PLUTO_TEMPERATURE"));
        assert!(AppConfig::from_lookup(lookup(&[("PLUTO_STREAM", "maybe")])).is_err());
    }
}
