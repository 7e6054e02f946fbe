//! Prometheus metrics registry: one counter/gauge family per tier
//! (persistent cache, negative cache, shared-memory cache, provider,
//! enumeration), built with the usual `with_opts(opts!(...))` construction
//! style.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder, opts};

pub struct ResponderMetrics {
    registry: Registry,

    pub negcache_hits: IntCounter,
    pub negcache_misses: IntCounter,
    pub negcache_sets: IntCounter,

    pub mcache_stores: IntCounter,
    pub mcache_invalidations: IntCounter,
    pub mcache_occupied_slots: IntGauge,

    pub provider_refreshes: IntCounter,
    pub provider_refresh_failures: IntCounter,
    pub provider_inflight: IntGauge,

    pub enumeration_snapshots_built: IntCounter,
    pub enumeration_getxxent_calls: IntCounter,

    pub requests_total: IntCounter,
    pub requests_failed: IntCounter,
}

impl ResponderMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let negcache_hits = IntCounter::with_opts(opts!(
            "nssrespd_negcache_hits_total",
            "Total negative-cache hits"
        ))?;
        let negcache_misses = IntCounter::with_opts(opts!(
            "nssrespd_negcache_misses_total",
            "Total negative-cache misses"
        ))?;
        let negcache_sets = IntCounter::with_opts(opts!(
            "nssrespd_negcache_sets_total",
            "Total entries inserted into the negative cache"
        ))?;

        let mcache_stores = IntCounter::with_opts(opts!(
            "nssrespd_mcache_stores_total",
            "Total writes into the shared-memory lookup cache"
        ))?;
        let mcache_invalidations = IntCounter::with_opts(opts!(
            "nssrespd_mcache_invalidations_total",
            "Total slot invalidations in the shared-memory lookup cache"
        ))?;
        let mcache_occupied_slots = IntGauge::with_opts(opts!(
            "nssrespd_mcache_occupied_slots",
            "Current number of occupied shared-memory cache slots"
        ))?;

        let provider_refreshes = IntCounter::with_opts(opts!(
            "nssrespd_provider_refreshes_total",
            "Total provider refresh dispatches"
        ))?;
        let provider_refresh_failures = IntCounter::with_opts(opts!(
            "nssrespd_provider_refresh_failures_total",
            "Total provider refreshes that failed"
        ))?;
        let provider_inflight = IntGauge::with_opts(opts!(
            "nssrespd_provider_inflight",
            "Current number of in-flight provider refreshes"
        ))?;

        let enumeration_snapshots_built = IntCounter::with_opts(opts!(
            "nssrespd_enumeration_snapshots_built_total",
            "Total enumeration snapshots built"
        ))?;
        let enumeration_getxxent_calls = IntCounter::with_opts(opts!(
            "nssrespd_enumeration_getxxent_calls_total",
            "Total getXXent paging calls served"
        ))?;

        let requests_total = IntCounter::with_opts(opts!(
            "nssrespd_requests_total",
            "Total client requests received"
        ))?;
        let requests_failed = IntCounter::with_opts(opts!(
            "nssrespd_requests_failed_total",
            "Total client requests that returned a non-zero status"
        ))?;

        registry.register(Box::new(negcache_hits.clone()))?;
        registry.register(Box::new(negcache_misses.clone()))?;
        registry.register(Box::new(negcache_sets.clone()))?;
        registry.register(Box::new(mcache_stores.clone()))?;
        registry.register(Box::new(mcache_invalidations.clone()))?;
        registry.register(Box::new(mcache_occupied_slots.clone()))?;
        registry.register(Box::new(provider_refreshes.clone()))?;
        registry.register(Box::new(provider_refresh_failures.clone()))?;
        registry.register(Box::new(provider_inflight.clone()))?;
        registry.register(Box::new(enumeration_snapshots_built.clone()))?;
        registry.register(Box::new(enumeration_getxxent_calls.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_failed.clone()))?;

        Ok(Self {
            registry,
            negcache_hits,
            negcache_misses,
            negcache_sets,
            mcache_stores,
            mcache_invalidations,
            mcache_occupied_slots,
            provider_refreshes,
            provider_refresh_failures,
            provider_inflight,
            enumeration_snapshots_built,
            enumeration_getxxent_calls,
            requests_total,
            requests_failed,
        })
    }

    /// Pulls the live atomics off `mcache`/`provider` into gauge/counter
    /// snapshots; called right before `/metrics` is scraped rather than on
    /// every request.
    pub fn sync_from(
        &self,
        mcache: &crate::mcache::Mcache,
        provider: &crate::provider::ProviderAdapter,
        negcache: &crate::negcache::NegCache,
    ) {
        use std::sync::atomic::Ordering;
        self.mcache_occupied_slots.set(mcache.occupied_slots() as i64);
        self.mcache_stores.reset();
        self.mcache_stores.inc_by(mcache.stores.load(Ordering::Relaxed));
        self.mcache_invalidations.reset();
        self.mcache_invalidations.inc_by(mcache.invalidations.load(Ordering::Relaxed));
        self.provider_inflight.set(provider.inflight_count() as i64);

        self.negcache_hits.reset();
        self.negcache_hits.inc_by(negcache.stats.hits.load(Ordering::Relaxed));
        self.negcache_misses.reset();
        self.negcache_misses.inc_by(negcache.stats.misses.load(Ordering::Relaxed));
        self.negcache_sets.reset();
        self.negcache_sets.inc_by(negcache.stats.sets.load(Ordering::Relaxed));
    }

    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}
