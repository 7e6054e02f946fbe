//! End-to-end tests driving the pipeline, enumeration engine, and idmap
//! context the way a real client session would, without a wire socket in
//! the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use nssrespd::config::ShellConfig;
use nssrespd::domain::Domain;
use nssrespd::enumeration::{EnumKind, EnumerationEngine};
use nssrespd::error::{ResponderError, Result};
use nssrespd::idmap::IdmapContext;
use nssrespd::mcache::Mcache;
use nssrespd::negcache::{NegCache, NegKey};
use nssrespd::pipeline::Pipeline;
use nssrespd::provider::{Provider, ProviderAdapter, RefreshKind};
use nssrespd::sid::Sid;
use nssrespd::sysdb::{PosixClass, SledSysdb, Sysdb, SysdbRecord};

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
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
        has_provider: true,
    }
}

fn sample_user(name: &str, uid: u32, cache_expire: i64) -> SysdbRecord {
    SysdbRecord {
        name: name.into(),
        aliases: vec![],
        uid: Some(uid),
        gid: Some(uid),
        class: PosixClass::User,
        sid: None,
        gecos: None,
        homedir: None,
        shell: None,
        members: vec![],
        original_primary_gid: None,
        cache_expire,
        initgroups_expire: None,
    }
}

/// Stands in for the provider message bus: writing a fresh record into the
/// shared `sysdb` on `account_request` models a successful provider fetch
/// landing in the persistent cache.
struct FakeProvider {
    sysdb: Arc<dyn Sysdb>,
    calls: AtomicU32,
    delay: Duration,
    fail: bool,
}

impl FakeProvider {
    fn new(sysdb: Arc<dyn Sysdb>) -> Self {
        Self {
            sysdb,
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: false,
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn account_request(&self, domain: &str, kind: RefreshKind, key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ResponderError::ProviderUnavailable("backend down".into()));
        }
        if kind == RefreshKind::User {
            self.sysdb
                .store_user(domain, &sample_user(key, 5000, now_epoch() + 3600))?;
        }
        Ok(())
    }

    async fn domains_refresh(&self, _hint_domain: Option<&str>) -> Result<()> {
        Ok(())
    }
}

fn build_pipeline(dir: &std::path::Path, sysdb: Arc<dyn Sysdb>, provider: Arc<dyn Provider>) -> Pipeline {
    let mcache = Arc::new(Mcache::create(&dir.join("mcache.bin"), 64, 256).unwrap());
    let negcache = Arc::new(NegCache::new(Duration::from_millis(50)));
    Pipeline {
        sysdb,
        negcache,
        mcache,
        provider: Arc::new(ProviderAdapter::new(provider)),
        refresh_window: Duration::from_secs(5),
        shell_policy: ShellConfig::default(),
    }
}

#[tokio::test]
async fn getpwnam_on_empty_cache_triggers_provider_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let sysdb: Arc<dyn Sysdb> = Arc::new(SledSysdb::open(&dir.path().join("db")).unwrap());
    let provider = Arc::new(FakeProvider::new(sysdb.clone()));
    let pipeline = build_pipeline(dir.path(), sysdb, provider.clone());

    let domains = vec![sample_domain("dom")];
    let reply = pipeline.getpwnam(&domains, "alice").await.unwrap();
    assert!(!reply.is_empty(), "expected a populated passwd reply after the provider fetch landed the record");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn getpwuid_out_of_range_skips_domain_without_a_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let sysdb: Arc<dyn Sysdb> = Arc::new(SledSysdb::open(&dir.path().join("db")).unwrap());
    let provider = Arc::new(FakeProvider::new(sysdb.clone()));
    let mut domain = sample_domain("dom");
    domain.id_min = 10_000;
    domain.id_max = 20_000;
    let pipeline = build_pipeline(dir.path(), sysdb, provider.clone());

    let reply = pipeline.getpwuid(&[domain], 42).await.unwrap();
    assert!(reply.is_empty(), "uid outside the domain's range must never reach the provider");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_duplicate_requests_coalesce_into_one_provider_call() {
    let dir = tempfile::tempdir().unwrap();
    let sysdb: Arc<dyn Sysdb> = Arc::new(SledSysdb::open(&dir.path().join("db")).unwrap());
    let mut fake = FakeProvider::new(sysdb.clone());
    fake.delay = Duration::from_millis(100);
    let provider = Arc::new(fake);
    let mcache = Arc::new(Mcache::create(&dir.path().join("mcache.bin"), 64, 256).unwrap());
    let negcache = Arc::new(NegCache::new(Duration::from_millis(50)));
    let adapter = Arc::new(ProviderAdapter::new(provider.clone()));
    let pipeline = Arc::new(Pipeline {
        sysdb,
        negcache,
        mcache,
        provider: adapter,
        refresh_window: Duration::from_secs(5),
        shell_policy: ShellConfig::default(),
    });
    let domains = vec![sample_domain("dom")];

    let (a, b, c) = tokio::join!(
        pipeline.getpwnam(&domains, "carol"),
        pipeline.getpwnam(&domains, "carol"),
        pipeline.getpwnam(&domains, "carol"),
    );
    assert!(!a.unwrap().is_empty());
    assert!(!b.unwrap().is_empty());
    assert!(!c.unwrap().is_empty());
    assert_eq!(
        provider.calls.load(Ordering::SeqCst),
        1,
        "three concurrent misses on the same key must share one provider dispatch"
    );
}

#[tokio::test]
async fn negative_cache_expiry_allows_a_second_refresh_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let sysdb: Arc<dyn Sysdb> = Arc::new(SledSysdb::open(&dir.path().join("db")).unwrap());
    let mut fake = FakeProvider::new(sysdb.clone());
    fake.fail = true;
    let provider = Arc::new(fake);
    let mcache = Arc::new(Mcache::create(&dir.path().join("mcache.bin"), 64, 256).unwrap());
    let negcache = Arc::new(NegCache::new(Duration::from_millis(20)));
    let pipeline = Pipeline {
        sysdb,
        negcache: negcache.clone(),
        mcache,
        provider: Arc::new(ProviderAdapter::new(provider.clone())),
        refresh_window: Duration::from_secs(5),
        shell_policy: ShellConfig::default(),
    };
    let domains = vec![sample_domain("dom")];

    let reply = pipeline.getpwnam(&domains, "dave").await.unwrap();
    assert!(reply.is_empty());
    assert!(negcache.check(&NegKey::UserName("dom".into(), "dave".into())));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // second lookup within the TTL is served from the negative cache, no
    // second provider dispatch.
    let reply2 = pipeline.getpwnam(&domains, "dave").await.unwrap();
    assert!(reply2.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let reply3 = pipeline.getpwnam(&domains, "dave").await.unwrap();
    assert!(reply3.is_empty());
    assert_eq!(
        provider.calls.load(Ordering::SeqCst),
        2,
        "an expired negative-cache entry must allow a fresh refresh attempt"
    );
}

#[tokio::test]
async fn sid_round_trips_through_algorithmic_mapping() {
    let mut idmap = IdmapContext::new(200_000, 2_000_000_000, 200_000, false);
    let domain_sid = Sid::from_str_sid("S-1-5-21-111-222-333").unwrap();
    idmap.add_domain_ex("dom", &domain_sid, None, None, 1000, false).unwrap();

    let user_sid = domain_sid.child(1500);
    let unix_id = idmap.sid_to_unix(&user_sid).unwrap();
    let back = idmap.unix_to_sid(unix_id).unwrap();
    assert_eq!(back, user_sid);

    // a RID below the domain's first_rid has no mapping.
    let below_first = domain_sid.child(500);
    assert!(idmap.sid_to_unix(&below_first).is_err());
}

#[tokio::test]
async fn enumeration_snapshot_expires_mid_paging_and_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let sysdb: Arc<dyn Sysdb> = Arc::new(SledSysdb::open(&dir.path().join("db")).unwrap());
    sysdb.store_user("dom", &sample_user("alice", 1000, 0)).unwrap();
    sysdb.store_user("dom", &sample_user("bob", 1001, 0)).unwrap();
    let provider = Arc::new(FakeProvider::new(sysdb.clone()));
    let adapter = Arc::new(ProviderAdapter::new(provider));
    let engine = EnumerationEngine::new(sysdb.clone(), adapter, Duration::from_millis(20));
    let mut domain = sample_domain("dom");
    domain.has_provider = false;
    let domains = vec![domain];

    let mut cursor = engine.setxxent(&domains, EnumKind::Users).await.unwrap();
    let first = engine.getxxent(&domains, EnumKind::Users, &mut cursor, 1).await.unwrap();
    assert_eq!(first.len(), 1);

    // let the snapshot TTL lapse mid-paging; the next getxxent call must
    // transparently rebuild the snapshot rather than erroring.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = engine.getxxent(&domains, EnumKind::Users, &mut cursor, 1).await.unwrap();
    assert_eq!(second.len(), 1);
}
