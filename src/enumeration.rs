//! Enumeration engine (Component G): builds, shares, and expires
//! multi-domain snapshots for `setXXent`/`getXXent`/`endXXent`.
//!
//! Waiters for an in-progress snapshot are modeled as a broadcast future,
//! the same pattern `provider.rs` uses to coalesce refreshes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::domain::{Domain, DomainIter, SearchMode};
use crate::error::{ResponderError, Result};
use crate::provider::{ProviderAdapter, RefreshKey, RefreshKind};
use crate::sysdb::{Sysdb, SysdbRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumKind {
    Users,
    Groups,
    Services,
}

/// A kind-erased row: either a `SysdbRecord` or a `ServiceRecord`,
/// depending on which `EnumKind` built this snapshot.
#[derive(Debug, Clone)]
pub enum EnumRow {
    Account(SysdbRecord),
    Service(crate::sysdb::ServiceRecord),
}

struct DomainResults {
    domain: String,
    results: Vec<EnumRow>,
}

enum SnapshotState {
    Building(broadcast::Sender<SnapshotEvent>),
    Ready {
        per_domain: Vec<DomainResults>,
        created_at: Instant,
    },
}

#[derive(Debug, Clone)]
enum SnapshotEvent {
    Ready,
    Failed(String),
}

pub struct EnumerationEngine {
    sysdb: Arc<dyn Sysdb>,
    provider: Arc<ProviderAdapter>,
    ttl: Duration,
    snapshots: Mutex<std::collections::HashMap<EnumKind, SnapshotState>>,
}

/// Per-client cursor into a kind's current snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetentCursor {
    pub domain_index: usize,
    pub entry_index: usize,
}

impl EnumerationEngine {
    pub fn new(sysdb: Arc<dyn Sysdb>, provider: Arc<ProviderAdapter>, ttl: Duration) -> Self {
        Self {
            sysdb,
            provider,
            ttl,
            snapshots: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn refresh_kind(kind: EnumKind) -> RefreshKind {
        match kind {
            EnumKind::Users => RefreshKind::User,
            EnumKind::Groups => RefreshKind::Group,
            EnumKind::Services => RefreshKind::Service,
        }
    }

    fn fetch(&self, kind: EnumKind, domain: &str) -> Result<Vec<EnumRow>> {
        match kind {
            EnumKind::Users => Ok(self.sysdb.enumpwent(domain)?.into_iter().map(EnumRow::Account).collect()),
            EnumKind::Groups => Ok(self.sysdb.enumgrent(domain)?.into_iter().map(EnumRow::Account).collect()),
            EnumKind::Services => Ok(self.sysdb.enumservent(domain)?.into_iter().map(EnumRow::Service).collect()),
        }
    }

    fn is_expired(&self, created_at: Instant) -> bool {
        created_at.elapsed() >= self.ttl
    }

    /// `setXXent`: resets the cursor, returns immediately if a ready
    /// unexpired snapshot exists, joins construction if one is in flight,
    /// or builds a fresh one.
    pub async fn setxxent(&self, domains: &[Domain], kind: EnumKind) -> Result<GetentCursor> {
        if DomainIter::new(domains, SearchMode::Enumeration).next().is_none() {
            return Err(ResponderError::NotFound);
        }

        let mut rx = {
            let mut snapshots = self.snapshots.lock();
            match snapshots.get(&kind) {
                Some(SnapshotState::Ready { created_at, .. }) if !self.is_expired(*created_at) => {
                    return Ok(GetentCursor::default());
                }
                Some(SnapshotState::Building(tx)) => Some(tx.subscribe()),
                _ => {
                    let (tx, rx) = broadcast::channel(1);
                    snapshots.insert(kind, SnapshotState::Building(tx));
                    drop(snapshots);
                    self.build_snapshot(domains, kind).await;
                    Some(rx)
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            match rx.recv().await {
                Ok(SnapshotEvent::Ready) | Err(_) => {}
                Ok(SnapshotEvent::Failed(msg)) => return Err(ResponderError::Backend(msg)),
            }
        }

        Ok(GetentCursor::default())
    }

    async fn build_snapshot(&self, domains: &[Domain], kind: EnumKind) {
        let mut per_domain = Vec::new();
        for domain in DomainIter::new(domains, SearchMode::Enumeration) {
            if domain.has_provider {
                let _ = self
                    .provider
                    .refresh(RefreshKey {
                        domain: domain.name.clone(),
                        kind: Self::refresh_kind(kind),
                        key: "__enumerate__".into(),
                    })
                    .await;
            }
            match self.fetch(kind, &domain.name) {
                Ok(results) => per_domain.push(DomainResults {
                    domain: domain.name.clone(),
                    results,
                }),
                Err(e) => {
                    let mut snapshots = self.snapshots.lock();
                    if let Some(SnapshotState::Building(tx)) = snapshots.remove(&kind) {
                        let _ = tx.send(SnapshotEvent::Failed(e.to_string()));
                    }
                    return;
                }
            }
        }

        let mut snapshots = self.snapshots.lock();
        let waiter = snapshots.remove(&kind);
        snapshots.insert(
            kind,
            SnapshotState::Ready {
                per_domain,
                created_at: Instant::now(),
            },
        );
        if let Some(SnapshotState::Building(tx)) = waiter {
            let _ = tx.send(SnapshotEvent::Ready);
        }
    }

    /// `getXXent(n)`: if the snapshot has expired since the cursor was
    /// taken, performs an implicit `setXXent`, preserving the cursor across
    /// the rebuild.
    /// Returns up to `n` `(row, owning domain name)` pairs so the caller can
    /// apply that domain's own qualify/override rules instead of guessing.
    pub async fn getxxent(
        &self,
        domains: &[Domain],
        kind: EnumKind,
        cursor: &mut GetentCursor,
        n: usize,
    ) -> Result<Vec<(EnumRow, String)>> {
        let needs_rebuild = {
            let snapshots = self.snapshots.lock();
            match snapshots.get(&kind) {
                Some(SnapshotState::Ready { created_at, .. }) => self.is_expired(*created_at),
                _ => true,
            }
        };

        if needs_rebuild {
            let saved = *cursor;
            *cursor = self.setxxent(domains, kind).await?;
            *cursor = saved;
        }

        let snapshots = self.snapshots.lock();
        let Some(SnapshotState::Ready { per_domain, .. }) = snapshots.get(&kind) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let Some(domain_results) = per_domain.get(cursor.domain_index) else {
                break;
            };
            let Some(entry) = domain_results.results.get(cursor.entry_index) else {
                cursor.domain_index += 1;
                cursor.entry_index = 0;
                continue;
            };
            out.push((entry.clone(), domain_results.domain.clone()));
            cursor.entry_index += 1;
        }
        Ok(out)
    }

    pub fn endxxent(&self, cursor: &mut GetentCursor) {
        *cursor = GetentCursor::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use async_trait::async_trait;

    struct StubSysdb;
    impl Sysdb for StubSysdb {
        fn getpwnam(&self, _: &str, _: &str) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn getpwuid(&self, _: &str, _: u32) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn getgrnam(&self, _: &str, _: &str) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn getgrgid(&self, _: &str, _: u32) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn search_object_by_sid(&self, _: &str, _: &str) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn initgroups(&self, _: &str, _: &str) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn enumpwent(&self, _domain: &str) -> Result<Vec<SysdbRecord>> {
            Ok(vec![sample("alice", 1000), sample("bob", 1001)])
        }
        fn enumgrent(&self, _domain: &str) -> Result<Vec<SysdbRecord>> {
            Ok(vec![])
        }
        fn store_user(&self, _: &str, _: &SysdbRecord) -> Result<()> {
            Ok(())
        }
        fn store_group(&self, _: &str, _: &SysdbRecord) -> Result<()> {
            Ok(())
        }
        fn delete_user(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn delete_group(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn getservbyname(&self, _: &str, _: &str, _: &str) -> Result<Vec<crate::sysdb::ServiceRecord>> {
            Ok(vec![])
        }
        fn getservbyport(&self, _: &str, _: u16, _: &str) -> Result<Vec<crate::sysdb::ServiceRecord>> {
            Ok(vec![])
        }
        fn enumservent(&self, _: &str) -> Result<Vec<crate::sysdb::ServiceRecord>> {
            Ok(vec![])
        }
        fn store_service(&self, _: &str, _: &crate::sysdb::ServiceRecord) -> Result<()> {
            Ok(())
        }
        fn transaction_start(&self) -> Result<()> {
            Ok(())
        }
        fn transaction_commit(&self) -> Result<()> {
            Ok(())
        }
        fn transaction_cancel(&self) -> Result<()> {
            Ok(())
        }
    }

    struct StubProvider;
    #[async_trait]
    impl Provider for StubProvider {
        async fn account_request(&self, _domain: &str, _kind: RefreshKind, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn domains_refresh(&self, _hint_domain: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    fn sample(name: &str, uid: u32) -> SysdbRecord {
        SysdbRecord {
            name: name.into(),
            aliases: vec![],
            uid: Some(uid),
            gid: Some(uid),
            class: crate::sysdb::PosixClass::User,
            sid: None,
            gecos: None,
            homedir: None,
            shell: None,
            members: vec![],
            original_primary_gid: None,
            cache_expire: 0,
            initgroups_expire: None,
        }
    }

    fn sample_domain(name: &str) -> Domain {
        Domain {
            name: name.into(),
            domain_sid: None,
            id_min: 0,
            id_max: u32::MAX,
            enumerate: true,
            fqnames: false,
            case_sensitive: true,
            mpg: false,
            override_gid: None,
            override_homedir: None,
            fallback_homedir: None,
            override_shell: None,
            default_shell: None,
            subdomains: vec![],
            has_provider: false,
        }
    }

    #[tokio::test]
    async fn setxxent_then_getxxent_pages_results() {
        let engine = EnumerationEngine::new(
            Arc::new(StubSysdb),
            Arc::new(crate::provider::ProviderAdapter::new(Arc::new(StubProvider))),
            Duration::from_secs(60),
        );
        let domains = vec![sample_domain("dom")];
        let mut cursor = engine.setxxent(&domains, EnumKind::Users).await.unwrap();
        let page = engine.getxxent(&domains, EnumKind::Users, &mut cursor, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(matches!(&page[0], (EnumRow::Account(r), d) if r.name == "alice" && d == "dom"));

        let page2 = engine.getxxent(&domains, EnumKind::Users, &mut cursor, 1).await.unwrap();
        assert!(matches!(&page2[0], (EnumRow::Account(r), _) if r.name == "bob"));
    }

    #[tokio::test]
    async fn no_enumerable_domains_is_not_found() {
        let engine = EnumerationEngine::new(
            Arc::new(StubSysdb),
            Arc::new(crate::provider::ProviderAdapter::new(Arc::new(StubProvider))),
            Duration::from_secs(60),
        );
        let mut d = sample_domain("dom");
        d.enumerate = false;
        let err = engine.setxxent(&[d], EnumKind::Users).await.unwrap_err();
        assert!(matches!(err, ResponderError::NotFound));
    }
}
