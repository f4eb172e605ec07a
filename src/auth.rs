//! Identity boundary. Authentication itself happens elsewhere; this module only
//! answers "who is signed in" and caches the answer for a few minutes.

use crate::models::User;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<User>;
    async fn sign_out(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(User),
    SignedOut,
}

/// A single fixed user. Used by the terminal front end.
pub struct StaticIdentity {
    user: RwLock<Option<User>>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user: RwLock::new(Some(User { id: user_id.into() })),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            user: RwLock::new(None),
        }
    }

    pub async fn sign_in(&self, user_id: impl Into<String>) {
        *self.user.write().await = Some(User { id: user_id.into() });
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        *self.user.write().await = None;
        Ok(())
    }
}

struct CachedUser {
    user: User,
    fetched_at: Instant,
}

/// Wraps another provider and remembers the signed-in user for `ttl`.
pub struct CachedIdentity<P> {
    inner: P,
    ttl: Duration,
    cache: Mutex<Option<CachedUser>>,
    events: broadcast::Sender<AuthEvent>,
}

impl<P: IdentityProvider> CachedIdentity<P> {
    pub fn new(inner: P) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(inner: P, ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner,
            ttl,
            cache: Mutex::new(None),
            events,
        }
    }

    /// Receives every auth change applied through [`Self::handle_auth_event`] or
    /// [`IdentityProvider::sign_out`].
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Feeds an auth change from the identity backend into the cache.
    pub async fn handle_auth_event(&self, event: AuthEvent) {
        {
            let mut cache = self.cache.lock().await;
            match &event {
                AuthEvent::SignedIn(user) => {
                    log::debug!("Caching signed-in user {}", user.id);
                    *cache = Some(CachedUser {
                        user: user.clone(),
                        fetched_at: Instant::now(),
                    });
                }
                AuthEvent::SignedOut => {
                    log::debug!("Dropping cached user after sign-out");
                    *cache = None;
                }
            }
        }
        let _ = self.events.send(event);
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: IdentityProvider> IdentityProvider for CachedIdentity<P> {
    async fn current_user(&self) -> Option<User> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Some(cached.user.clone());
            }
            *cache = None;
        }

        let user = self.inner.current_user().await?;
        *cache = Some(CachedUser {
            user: user.clone(),
            fetched_at: Instant::now(),
        });
        Some(user)
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        // Lookups wait on the cache lock until the backend has signed out.
        let mut cache = self.cache.lock().await;
        *cache = None;
        self.inner.sign_out().await?;
        drop(cache);
        let _ = self.events.send(AuthEvent::SignedOut);
        Ok(())
    }
}
