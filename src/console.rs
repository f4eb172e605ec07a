//! Line-oriented terminal front end. Plain text is sent as a message; lines starting
//! with `/` are commands.

use crate::auth::{AuthEvent, CachedIdentity, IdentityProvider, StaticIdentity};
use crate::error::ChatError;
use crate::models::{Conversation, Provider, User};
use crate::orchestrator;
use crate::state::{AppState, ChatEvent};
use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::TryRecvError;

const HELP: &str = "\
Commands:
  /new [title]        start a conversation
  /list               list conversations
  /open <n>           switch to conversation n from /list
  /rename <title>     rename the current conversation
  /delete             delete the current conversation
  /history            print the current conversation
  /regen              regenerate the last answer
  /provider [name]    show settings, or switch to openai|openrouter|ollama|lmstudio|none
  /key <api key>      save an API key for the current provider
  /endpoint <url>     save a custom endpoint for the current provider
  /clear              forget the stored key and endpoint
  /stream on|off      toggle streaming replies
  /login <user>       sign in as another user
  /logout             sign out
  /quit               exit
Ctrl-C while a reply is arriving abandons it.";

struct Session {
    state: AppState,
    auth: Arc<CachedIdentity<StaticIdentity>>,
    conversation: Conversation,
    listed: Vec<Conversation>,
    stream: bool,
}

enum Flow {
    Continue,
    Quit,
}

pub async fn run_console(
    state: AppState,
    auth: Arc<CachedIdentity<StaticIdentity>>,
) -> Result<()> {
    let app_scope = state.config.app_scope.clone();
    let conversation = orchestrator::open_latest_conversation(&state, &app_scope)
        .await
        .context("Failed to open a conversation")?;
    let stream = state.config.stream;
    let mut session = Session {
        state,
        auth,
        conversation,
        listed: Vec::new(),
        stream,
    };

    println!("Pluto chat. Type /help for commands.");
    session.print_header();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line.strip_prefix('/') {
            Some(command) => session.command(command).await,
            None => session.send(line).await.map(|_| Flow::Continue),
        };
        match result {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => println!("! {}", e),
        }
    }
    Ok(())
}

impl Session {
    fn print_header(&self) {
        println!("-- {} ({})", self.conversation.title, self.conversation.id);
    }

    async fn command(&mut self, input: &str) -> Result<Flow, ChatError> {
        let (name, arg) = match input.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (input, ""),
        };
        let app_scope = self.state.config.app_scope.clone();

        match name {
            "help" => println!("{}", HELP),
            "quit" | "exit" => return Ok(Flow::Quit),
            "new" => {
                let title = (!arg.is_empty()).then_some(arg);
                self.conversation =
                    orchestrator::create_conversation(&self.state, &app_scope, title).await?;
                self.print_header();
            }
            "list" => {
                self.listed = orchestrator::list_conversations(&self.state, &app_scope).await?;
                for (i, c) in self.listed.iter().enumerate() {
                    let marker = if c.id == self.conversation.id { "*" } else { " " };
                    let summary = c.metadata.as_ref().map(|m| m.summary.as_str()).unwrap_or("");
                    println!("{}{:>3}  {}  {}", marker, i + 1, c.title, summary);
                }
            }
            "open" => {
                let picked = arg
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| self.listed.get(i).cloned());
                match picked {
                    Some(c) => {
                        self.conversation = c;
                        self.print_header();
                        self.print_history().await?;
                    }
                    None => println!("! run /list, then /open <n>"),
                }
            }
            "rename" => {
                orchestrator::rename_conversation(&self.state, self.conversation.id, arg).await?;
                self.conversation.title = arg.to_string();
                self.print_header();
            }
            "delete" => {
                orchestrator::delete_conversation(&self.state, self.conversation.id).await?;
                println!("Deleted {}", self.conversation.title);
                self.conversation =
                    orchestrator::open_latest_conversation(&self.state, &app_scope).await?;
                self.print_header();
            }
            "history" => self.print_history().await?,
            "regen" => self.regenerate().await?,
            "provider" => {
                if !arg.is_empty() {
                    let provider = match arg {
                        "none" => None,
                        other => match other.parse::<Provider>() {
                            Ok(p) => Some(p),
                            Err(e) => {
                                println!("! {}", e);
                                return Ok(Flow::Continue);
                            }
                        },
                    };
                    orchestrator::switch_provider(&self.state, provider).await?;
                }
                self.print_provider().await?;
            }
            "key" | "endpoint" => {
                let current = orchestrator::get_provider_config(&self.state).await?;
                let Some(provider) = current.as_ref().and_then(|c| c.provider) else {
                    return Err(ChatError::NoProviderConfigured);
                };
                let value = (!arg.is_empty()).then(|| arg.to_string());
                let (api_key, base_url) = match name {
                    "key" => (value, current.as_ref().and_then(|c| c.base_url.clone())),
                    _ => (current.as_ref().and_then(|c| c.api_key.clone()), value),
                };
                orchestrator::save_provider_config(&self.state, Some(provider), api_key, base_url)
                    .await?;
                self.print_provider().await?;
            }
            "clear" => {
                orchestrator::clear_provider_credential(&self.state).await?;
                self.print_provider().await?;
            }
            "stream" => {
                self.stream = match arg {
                    "on" => true,
                    "off" => false,
                    _ => !self.stream,
                };
                println!("Streaming {}", if self.stream { "on" } else { "off" });
            }
            "login" => {
                if arg.is_empty() {
                    println!("! usage: /login <user>");
                    return Ok(Flow::Continue);
                }
                self.auth.inner().sign_in(arg).await;
                self.auth
                    .handle_auth_event(AuthEvent::SignedIn(User { id: arg.to_string() }))
                    .await;
                self.conversation =
                    orchestrator::open_latest_conversation(&self.state, &app_scope).await?;
                println!("Signed in as {}", arg);
                self.print_header();
            }
            "logout" => {
                self.state.abandon(self.conversation.id);
                self.auth.sign_out().await?;
                self.listed.clear();
                println!("Signed out. Use /login <user> to continue.");
            }
            other => println!("! unknown command /{} (try /help)", other),
        }
        Ok(Flow::Continue)
    }

    async fn print_history(&self) -> Result<(), ChatError> {
        let messages =
            orchestrator::get_conversation_messages(&self.state, self.conversation.id).await?;
        for m in messages {
            println!("[{}] {}", m.role.as_str(), m.content);
        }
        Ok(())
    }

    async fn print_provider(&self) -> Result<(), ChatError> {
        match orchestrator::get_provider_config(&self.state).await? {
            Some(config) => {
                let provider = config.provider.map(Provider::as_str).unwrap_or("none");
                let key = if config.api_key().is_some() { "set" } else { "not set" };
                let endpoint = config
                    .base_url()
                    .or(config.provider.map(Provider::default_base_url))
                    .unwrap_or("-");
                println!("Provider: {}  key: {}  endpoint: {}", provider, key, endpoint);
            }
            None => println!("No provider configured. Use /provider <name>."),
        }
        Ok(())
    }

    async fn send(&mut self, text: &str) -> Result<(), ChatError> {
        let conversation_id = self.conversation.id;
        let turn = orchestrator::submit(&self.state, conversation_id, text, self.stream);
        let (result, streamed) = self.follow(conversation_id, turn).await;
        let outcome = result?;
        if streamed {
            println!();
        } else {
            println!("{}", outcome.assistant_message.content);
        }
        Ok(())
    }

    async fn regenerate(&mut self) -> Result<(), ChatError> {
        let conversation_id = self.conversation.id;
        let turn = orchestrator::regenerate(&self.state, conversation_id);
        let (result, streamed) = self.follow(conversation_id, turn).await;
        let message = result?;
        if streamed {
            println!();
        } else {
            println!("{}", message.content);
        }
        Ok(())
    }

    /// Drives `turn` to completion while echoing streamed chunks. Ctrl-C abandons it.
    /// The flag reports whether any chunk was printed.
    async fn follow<T>(
        &self,
        conversation_id: uuid::Uuid,
        turn: impl std::future::Future<Output = Result<T, ChatError>>,
    ) -> (Result<T, ChatError>, bool) {
        let mut events = self.state.subscribe();
        let mut streamed = false;
        tokio::pin!(turn);

        let result = loop {
            tokio::select! {
                result = &mut turn => break result,
                event = events.recv() => {
                    if let Ok(event) = event {
                        streamed |= print_chunk(conversation_id, &event);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    self.state.abandon(conversation_id);
                }
            }
        };
        loop {
            match events.try_recv() {
                Ok(event) => streamed |= print_chunk(conversation_id, &event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        (result, streamed)
    }
}

fn print_chunk(conversation_id: uuid::Uuid, event: &ChatEvent) -> bool {
    match event {
        ChatEvent::AssistantChunk {
            conversation_id: id,
            delta,
            ..
        } if *id == conversation_id => {
            print!("{}", delta);
            std::io::stdout().flush().ok();
            true
        }
        _ => false,
    }
}
