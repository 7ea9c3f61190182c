//! Authenticated client cache
//!
//! Holds at most one logged-in vendor client per [`CacheKey`]. A miss starts
//! the login on its own task; every caller that arrives while it runs awaits
//! the same shared result, so a burst of first-use resolutions produces one
//! login. Callers that give up do not cancel the login.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::backend::{AuthenticatedClient, ProviderKind};
use crate::observability::metrics::{record_client_cache, CacheOutcome};
use crate::secrets::error::{Result, SecretsError};

/// Cache key: backend, named configuration and settings fingerprint
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub provider: ProviderKind,
    pub config_name: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(provider: ProviderKind, config_name: &str, fingerprint: &str) -> Self {
        Self {
            provider,
            config_name: config_name.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.fingerprint.get(..12).unwrap_or(&self.fingerprint);
        write!(f, "{}:{}:{}", self.provider, self.config_name, short)
    }
}

type LoginFuture = Shared<BoxFuture<'static, Result<AuthenticatedClient>>>;

type Slots = DashMap<CacheKey, Arc<Mutex<Slot>>>;

enum Slot {
    Empty,
    Pending { id: u64, login: LoginFuture },
    Ready(AuthenticatedClient),
    /// Removed from the map; a caller still holding it must look the key up again
    Retired,
}

/// Per-key slots of authenticated clients
///
/// Each slot has its own mutex, held only for slot bookkeeping and never
/// across an `.await`. Logins for different keys run independently.
///
/// Only keys with a ready client or a login in flight stay in the map. A
/// failed login, an invalidation, or a successful login under a newer
/// fingerprint for the same backend and configuration removes the slot.
/// Lock order is always map shard, then slot.
#[derive(Default)]
pub struct ClientCache {
    slots: Arc<Slots>,
    next_login: AtomicU64,
}

impl fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache").field("slots", &self.slots.len()).finish()
    }
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `key`, or run `factory` to create it.
    ///
    /// `factory` runs at most once per miss regardless of how many callers
    /// are waiting. A failed login drops the slot so the next call tries
    /// again; the error is returned to every waiter.
    pub async fn get_or_create<F, Fut>(&self, key: &CacheKey, factory: F) -> Result<AuthenticatedClient>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AuthenticatedClient>> + Send + 'static,
    {
        let mut factory = Some(factory);

        let login = loop {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::Empty)))
                .clone();

            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            match &*guard {
                Slot::Retired => continue,
                Slot::Ready(client) if client.is_valid() => {
                    debug!(cache_key = %key, "Client cache hit");
                    record_client_cache(key.provider.as_str(), CacheOutcome::Hit);
                    return Ok(client.clone());
                }
                Slot::Pending { login, .. } => {
                    debug!(cache_key = %key, "Joining in-flight login");
                    record_client_cache(key.provider.as_str(), CacheOutcome::Joined);
                    break login.clone();
                }
                Slot::Ready(_) | Slot::Empty => {
                    let Some(factory) = factory.take() else {
                        return Err(SecretsError::provider(key.provider.as_str(), "login factory already used"));
                    };
                    debug!(cache_key = %key, "Client cache miss, starting login");
                    record_client_cache(key.provider.as_str(), CacheOutcome::Miss);
                    let id = self.next_login.fetch_add(1, Ordering::Relaxed);
                    let login = spawn_login(
                        Arc::clone(&self.slots),
                        Arc::clone(&slot),
                        key.clone(),
                        id,
                        factory(),
                    );
                    *guard = Slot::Pending { id, login: login.clone() };
                    break login;
                }
            }
        };

        login.await
    }

    /// Drop a ready client so the next call logs in again.
    ///
    /// A login that is still in flight is left alone.
    pub fn invalidate(&self, key: &CacheKey) {
        let removed = self.slots.remove_if(key, |_, slot| retire_settled(slot));
        if removed.is_some() {
            debug!(cache_key = %key, "Invalidating cached client");
        }
    }

    /// Number of keys holding a ready client
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                matches!(&*entry.value().lock().unwrap_or_else(PoisonError::into_inner), Slot::Ready(_))
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys tracked, ready or in flight
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }
}

/// Mark a slot with no login in flight as retired. Called with the map shard
/// locked, so a retired slot is always one that is being removed.
fn retire_settled(slot: &Arc<Mutex<Slot>>) -> bool {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match &*guard {
        Slot::Ready(_) | Slot::Empty => {
            *guard = Slot::Retired;
            true
        }
        Slot::Pending { .. } | Slot::Retired => false,
    }
}

// The login runs on its own task and settles the slot itself, so it completes
// even when every waiting caller has been dropped.
fn spawn_login<Fut>(
    slots: Arc<Slots>,
    slot: Arc<Mutex<Slot>>,
    key: CacheKey,
    id: u64,
    login: Fut,
) -> LoginFuture
where
    Fut: Future<Output = Result<AuthenticatedClient>> + Send + 'static,
{
    let provider = key.provider;
    let handle = tokio::spawn(async move {
        let result = login.await;
        let settled = {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            // An invalidation may have replaced this login; only settle our own
            let ours = matches!(&*guard, Slot::Pending { id: current, .. } if *current == id);
            if ours {
                *guard = match &result {
                    Ok(client) => Slot::Ready(client.clone()),
                    Err(_) => Slot::Empty,
                };
            }
            ours
        };

        if settled {
            match &result {
                Ok(_) => {
                    // Clients for the same backend and configuration under an
                    // older fingerprint can never be hit again
                    slots.retain(|other, other_slot| {
                        !(other.provider == key.provider
                            && other.config_name == key.config_name
                            && other.fingerprint != key.fingerprint
                            && retire_settled(other_slot))
                    });
                }
                Err(_) => {
                    slots.remove_if(&key, |_, current| Arc::ptr_eq(current, &slot) && retire_settled(current));
                }
            }
        }
        result
    });

    async move {
        handle.await.unwrap_or_else(|e| {
            Err(SecretsError::provider(provider.as_str(), format!("login task failed: {}", e)))
        })
    }
    .boxed()
    .shared()
}
