//! `ResponderContext`: the single explicitly-owned value threading every
//! component through the process lifetime. No hidden global state: every
//! collaborator is reachable only by following a field off this struct.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ResponderConfig;
use crate::domain::Domain;
use crate::enumeration::EnumerationEngine;
use crate::error::Result;
use crate::idmap::IdmapContext;
use crate::mcache::Mcache;
use crate::metrics::ResponderMetrics;
use crate::negcache::NegCache;
use crate::pipeline::Pipeline;
use crate::provider::{Provider, ProviderAdapter};
use crate::sysdb::{Sysdb, SledSysdb};

pub struct ResponderContext {
    pub config: ResponderConfig,
    pub domains: RwLock<Vec<Domain>>,
    pub negcache: Arc<NegCache>,
    pub mcache: Arc<Mcache>,
    pub sysdb: Arc<dyn Sysdb>,
    pub provider: Arc<ProviderAdapter>,
    pub idmap: RwLock<IdmapContext>,
    pub enumeration: Arc<EnumerationEngine>,
    pub pipeline: Pipeline,
    pub metrics: Arc<ResponderMetrics>,
}

impl ResponderContext {
    pub fn new(
        config: ResponderConfig,
        provider_impl: Arc<dyn Provider>,
        idmap_lower: u32,
        idmap_upper: u32,
        idmap_range_size: u32,
        idmap_autorid: bool,
    ) -> Result<Self> {
        let sysdb: Arc<dyn Sysdb> = Arc::new(SledSysdb::open(&config.sysdb_path)?);
        let mcache = Arc::new(Mcache::create(
            &config.mcache_path,
            config.mcache.slot_count,
            config.mcache.slot_size,
        )?);
        let negcache = Arc::new(NegCache::new(config.negcache.ttl));
        let provider = Arc::new(ProviderAdapter::new(provider_impl));
        let enumeration = Arc::new(EnumerationEngine::new(
            sysdb.clone(),
            provider.clone(),
            config.enumeration.snapshot_ttl,
        ));
        let metrics = Arc::new(ResponderMetrics::new().map_err(|e| {
            crate::error::ResponderError::Fatal(format!("metrics registry init failed: {e}"))
        })?);

        let pipeline = Pipeline {
            sysdb: sysdb.clone(),
            negcache: negcache.clone(),
            mcache: mcache.clone(),
            provider: provider.clone(),
            refresh_window: config.provider.refresh_window,
            shell_policy: config.shell_policy.clone(),
        };

        let domains = config_domains_to_domains(&config.domains);

        Ok(Self {
            config,
            domains: RwLock::new(domains),
            negcache,
            mcache,
            sysdb,
            provider,
            idmap: RwLock::new(IdmapContext::new(
                idmap_lower,
                idmap_upper,
                idmap_range_size,
                idmap_autorid,
            )),
            enumeration,
            pipeline,
            metrics,
        })
    }

    pub fn domains_snapshot(&self) -> Vec<Domain> {
        self.domains.read().clone()
    }

    /// Periodic coherence sweep: mirrors `update_pw_memcache`/
    /// `update_gr_memcache` by walking the persistent cache and purging any
    /// shared-memory slot whose backing record has expired, plus bounds the
    /// negative cache's memory.
    pub fn run_coherence_sweep(&self) {
        self.negcache.cleanup_expired();
        for domain in self.domains_snapshot() {
            if let Ok(users) = self.sysdb.enumpwent(&domain.name) {
                for u in users {
                    if cache_expired(u.cache_expire) {
                        self.mcache.invalidate_by_name(&domain.qualify(&u.name), crate::mcache::slot::SlotKind::Passwd);
                        if let Some(uid) = u.uid {
                            self.mcache.invalidate_by_uid(uid);
                        }
                    }
                }
            }
            if let Ok(groups) = self.sysdb.enumgrent(&domain.name) {
                for g in groups {
                    if cache_expired(g.cache_expire) {
                        self.mcache.invalidate_by_name(&domain.qualify(&g.name), crate::mcache::slot::SlotKind::Group);
                        if let Some(gid) = g.gid {
                            self.mcache.invalidate_by_gid(gid);
                        }
                    }
                }
            }
        }
    }
}

fn cache_expired(expire: i64) -> bool {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    now >= expire
}

fn config_domains_to_domains(configs: &[crate::config::DomainConfig]) -> Vec<Domain> {
    configs.iter().map(config_domain_to_domain).collect()
}

fn config_domain_to_domain(c: &crate::config::DomainConfig) -> Domain {
    Domain {
        name: c.name.clone(),
        domain_sid: c.domain_sid.as_deref().and_then(|s| crate::sid::Sid::from_str_sid(s).ok()),
        id_min: c.id_min,
        id_max: c.id_max,
        enumerate: c.enumerate,
        fqnames: c.fqnames,
        case_sensitive: c.case_sensitive,
        mpg: c.mpg,
        override_gid: c.override_gid,
        override_homedir: c.override_homedir.clone(),
        fallback_homedir: c.fallback_homedir.clone(),
        override_shell: c.override_shell.clone(),
        default_shell: c.default_shell.clone(),
        subdomains: c.subdomains.iter().map(config_domain_to_domain).collect(),
        has_provider: true,
    }
}
