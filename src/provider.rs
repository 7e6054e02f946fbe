//! Provider adapter (Component H): async wrapper around the provider
//! message bus with in-flight refresh coalescing.
//!
//! The `Provider` trait follows the usual `#[async_trait]` shape for an
//! async collaborator; the coalescing map is a `DashMap`-backed sharing
//! idiom keyed on refresh identity instead of a cache key.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::{ResponderError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshKind {
    User,
    Group,
    Initgroups,
    Netgroup,
    Service,
    Secid,
    UserAndGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshKey {
    pub domain: String,
    pub kind: RefreshKind,
    pub key: String,
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Completed,
    Failed(String),
}

/// Abstract collaborator that reaches out to a remote directory. The
/// responder core only ever depends on this trait; a concrete LDAP/AD
/// fetcher implements it out of scope of this crate.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn account_request(&self, domain: &str, kind: RefreshKind, key: &str) -> Result<()>;

    async fn domains_refresh(&self, hint_domain: Option<&str>) -> Result<()>;
}

/// Coalesces concurrent refreshes for the same `(domain, kind, key)`: the
/// first caller dispatches to the `Provider` and creates a broadcast
/// channel; later callers for the same key just subscribe and await the
/// same completion.
pub struct ProviderAdapter {
    provider: Arc<dyn Provider>,
    inflight: DashMap<RefreshKey, broadcast::Sender<ProviderEvent>>,
}

impl ProviderAdapter {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            inflight: DashMap::new(),
        }
    }

    /// Dispatches (or joins an existing) refresh for `key`. Returns once
    /// the provider has completed or failed; callers then re-read the
    /// persistent cache. The first caller for a key becomes its leader and
    /// actually issues the provider request; the `entry` API's shard lock
    /// guarantees only one leader is ever elected per key.
    pub async fn refresh(&self, key: RefreshKey) -> Result<()> {
        let (mut rx, is_leader) = match self.inflight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().subscribe(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let (tx, rx) = broadcast::channel(1);
                e.insert(tx);
                (rx, true)
            }
        };

        if is_leader {
            self.dispatch(key).await;
        }

        match rx.recv().await {
            Ok(ProviderEvent::Completed) => Ok(()),
            Ok(ProviderEvent::Failed(msg)) => Err(ResponderError::RefreshFailed(msg)),
            Err(_) => Err(ResponderError::RefreshFailed("provider channel closed".into())),
        }
    }

    async fn dispatch(&self, key: RefreshKey) {
        let result = self
            .provider
            .account_request(&key.domain, key.kind.clone(), &key.key)
            .await;

        let event = match result {
            Ok(()) => ProviderEvent::Completed,
            Err(e) => ProviderEvent::Failed(e.to_string()),
        };

        if let Some((_, tx)) = self.inflight.remove(&key) {
            let _ = tx.send(event);
        }
    }

    pub async fn domains_refresh(&self, hint_domain: Option<&str>) -> Result<()> {
        self.provider.domains_refresh(hint_domain).await
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}
