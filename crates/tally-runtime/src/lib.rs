//! tally-runtime
//!
//! Explicit wiring from configuration to a ready [`Coordinator`]. No global
//! state: binaries call [`boot`] (or [`build_engine`] with an already-parsed
//! config) once and share the result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tally_config::secrets::{resolve_secrets, ResolvedSecrets};
use tally_config::{
    load_layered_yaml, report_unused_keys, EngineConfig, LoadedConfig, PolicyKind, StoreBackend,
    UnusedKeyPolicy,
};
use tally_reconcile::{
    Coordinator, CoordinatorSettings, IngressRules, Rate, ReconcilePolicy, Reconciler,
    RetryPolicy,
};
use tally_schemas::AttributeRef;
use tally_store::{AttributeStore, MemoryStore, ShopifyAdminStore, ShopifyStoreConfig, UnitsSoldSource};
use tracing::{info, warn};

/// Comma-separated config paths, merged in order.
pub const CONFIG_ENV: &str = "TALLY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/base.yaml";

/// Explicit paths win; then `TALLY_CONFIG`; then the default path.
pub fn config_paths(explicit: &[String]) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => vec![DEFAULT_CONFIG_PATH.to_string()],
    }
}

/// A fully wired engine plus the configuration it was built from.
pub struct Engine {
    pub config: EngineConfig,
    pub coordinator: Arc<Coordinator>,
    /// Present for the `memory` backend so callers can seed or inspect it.
    pub memory: Option<Arc<MemoryStore>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

/// Load layered YAML, resolve secrets, and wire the engine.
pub fn boot(paths: &[String]) -> Result<(LoadedConfig, Engine)> {
    let refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = load_layered_yaml(&refs)?;

    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config contains keys nothing reads");
    }

    let config = EngineConfig::from_json(&loaded.config_json)?;
    let secrets = resolve_secrets(&config)?;
    let engine = build_engine(config, &secrets)?;
    info!(
        config_hash = %loaded.config_hash,
        backend = engine.config.store.backend.as_str(),
        policy = engine.config.reconcile.policy.as_str(),
        "engine wired"
    );
    Ok((loaded, engine))
}

pub fn build_engine(config: EngineConfig, secrets: &ResolvedSecrets) -> Result<Engine> {
    let attribute = AttributeRef::new(&config.attribute.namespace, &config.attribute.key);

    let (store, source, memory): (
        Arc<dyn AttributeStore>,
        Arc<dyn UnitsSoldSource>,
        Option<Arc<MemoryStore>>,
    ) = match config.store.backend {
        StoreBackend::Shopify => {
            let base_url = config
                .store
                .resolved_base_url()
                .context("CONFIG_INVALID /store: shopify backend requires shop_domain or base_url")?;
            let Some(token) = secrets.store_access_token.clone() else {
                bail!(
                    "SECRETS_MISSING backend=shopify: env var '{}' not resolved",
                    config.store.access_token_env
                );
            };
            let shopify = ShopifyAdminStore::new(ShopifyStoreConfig {
                base_url,
                api_version: config.store.api_version.clone(),
                access_token: token,
                attribute,
                value_type: config.attribute.value_type.clone(),
                units_sold: Some(AttributeRef::new(
                    &config.units_sold.namespace,
                    &config.units_sold.key,
                )),
                timeout: Duration::from_millis(config.store.timeout_ms),
            })
            .map_err(|e| anyhow::anyhow!("STORE_INIT_FAILED: {e}"))?;
            let shopify = Arc::new(shopify);
            (
                shopify.clone() as Arc<dyn AttributeStore>,
                shopify as Arc<dyn UnitsSoldSource>,
                None,
            )
        }
        StoreBackend::Memory => {
            let mem = Arc::new(MemoryStore::new(attribute));
            (
                mem.clone() as Arc<dyn AttributeStore>,
                mem.clone() as Arc<dyn UnitsSoldSource>,
                Some(mem),
            )
        }
    };

    let rate = Rate::new(config.reconcile.rate)
        .map_err(|e| anyhow::anyhow!("CONFIG_INVALID /reconcile/rate: {e}"))?;
    let policy = match config.reconcile.policy {
        PolicyKind::Recompute => ReconcilePolicy::Recompute,
        PolicyKind::Incremental => ReconcilePolicy::Incremental,
    };
    if policy == ReconcilePolicy::Incremental {
        warn!("incremental policy active: redelivery safety relies on an in-memory dedupe window");
    }

    let reconciler = Reconciler::new(policy, store, rate)
        .with_source(source)
        .with_retry(retry_policy(&config))
        .with_serialized_recompute(config.reconcile.serialize_recompute);

    let settings = CoordinatorSettings {
        rules: IngressRules {
            paid_status: config.ingress.paid_status.clone(),
            reject_unknown_fields: config.ingress.reject_unknown_fields,
        },
        max_parallel_entities: config.reconcile.max_parallel_entities,
        dedupe_capacity: config.reconcile.dedupe_capacity,
        redeliver_on_total_outage: config.reconcile.redeliver_on_total_outage,
    };

    Ok(Engine {
        coordinator: Arc::new(Coordinator::new(Arc::new(reconciler), settings)),
        config,
        memory,
    })
}

fn retry_policy(config: &EngineConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.retry.max_attempts,
        base_delay: Duration::from_millis(config.retry.base_delay_ms),
        max_delay: Duration::from_millis(config.retry.max_delay_ms),
        unavailable_ceiling: config.retry.unavailable_ceiling,
    }
}
