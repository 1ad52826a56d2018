//! Typed view of the merged configuration document.
//!
//! Every value is read through a JSON pointer listed in
//! [`crate::CONSUMED_POINTERS`]. Absent keys fall back to the defaults below;
//! present-but-wrong-typed keys are refused with `CONFIG_INVALID` rather than
//! silently defaulted.

use anyhow::{bail, Result};
use serde_json::Value;
use tally_schemas::Micros;

pub const DEFAULT_NAMESPACE: &str = "mission_global_integration";
pub const DEFAULT_KEY: &str = "donation_total_value";
pub const DEFAULT_UNITS_SOLD_KEY: &str = "units_sold";
pub const DEFAULT_ACCESS_TOKEN_ENV: &str = "SHOPIFY_ADMIN_API_ACCESS_TOKEN";
pub const DEFAULT_API_VERSION: &str = "2023-10";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Commerce platform Admin GraphQL API.
    Shopify,
    /// In-process store; local development and dry runs.
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Shopify => "shopify",
            StoreBackend::Memory => "memory",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shopify" => Ok(StoreBackend::Shopify),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!(
                "CONFIG_INVALID /store/backend: unknown backend '{}'; expected one of: shopify | memory",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Recompute,
    Incremental,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Recompute => "recompute",
            PolicyKind::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recompute" => Ok(PolicyKind::Recompute),
            "incremental" => Ok(PolicyKind::Incremental),
            other => bail!(
                "CONFIG_INVALID /reconcile/policy: unknown policy '{}'; expected one of: recompute | incremental",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub shop_domain: Option<String>,
    /// Overrides `https://{shop_domain}` (tests, proxies).
    pub base_url: Option<String>,
    pub api_version: String,
    /// NAME of the env var holding the Admin API access token.
    pub access_token_env: String,
    pub timeout_ms: u64,
}

impl StoreSection {
    /// Effective origin of the Admin API, without a trailing slash.
    pub fn resolved_base_url(&self) -> Option<String> {
        if let Some(url) = &self.base_url {
            return Some(url.trim_end_matches('/').to_string());
        }
        self.shop_domain
            .as_ref()
            .map(|d| format!("https://{}", d.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSection {
    pub namespace: String,
    pub key: String,
    /// Platform value type written alongside the total.
    pub value_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitsSoldSection {
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSection {
    pub policy: PolicyKind,
    pub rate: Micros,
    pub max_parallel_entities: usize,
    pub serialize_recompute: bool,
    pub dedupe_capacity: usize,
    pub redeliver_on_total_outage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub unavailable_ceiling: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressSection {
    pub paid_status: String,
    pub reject_unknown_fields: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSection {
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
    pub heartbeat_secs: u64,
}

/// Everything the runtime needs to build an engine, minus secret values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub store: StoreSection,
    pub attribute: AttributeSection,
    pub units_sold: UnitsSoldSection,
    pub reconcile: ReconcileSection,
    pub retry: RetrySection,
    pub ingress: IngressSection,
    pub server: ServerSection,
}

impl EngineConfig {
    pub fn from_json(cfg: &Value) -> Result<Self> {
        let store = StoreSection {
            backend: match read_str(cfg, "/store/backend")? {
                Some(s) => StoreBackend::parse(&s)?,
                None => StoreBackend::Shopify,
            },
            shop_domain: read_str(cfg, "/store/shop_domain")?,
            base_url: read_str(cfg, "/store/base_url")?,
            api_version: read_str(cfg, "/store/api_version")?
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            access_token_env: read_str(cfg, "/store/access_token_env")?
                .unwrap_or_else(|| DEFAULT_ACCESS_TOKEN_ENV.to_string()),
            timeout_ms: read_u64(cfg, "/store/timeout_ms")?.unwrap_or(10_000),
        };

        let attribute = AttributeSection {
            namespace: read_str(cfg, "/attribute/namespace")?
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            key: read_str(cfg, "/attribute/key")?.unwrap_or_else(|| DEFAULT_KEY.to_string()),
            value_type: read_str(cfg, "/attribute/value_type")?
                .unwrap_or_else(|| "number_decimal".to_string()),
        };

        let units_sold = UnitsSoldSection {
            namespace: read_str(cfg, "/units_sold/namespace")?
                .unwrap_or_else(|| attribute.namespace.clone()),
            key: read_str(cfg, "/units_sold/key")?
                .unwrap_or_else(|| DEFAULT_UNITS_SOLD_KEY.to_string()),
        };

        let reconcile = ReconcileSection {
            policy: match read_str(cfg, "/reconcile/policy")? {
                Some(s) => PolicyKind::parse(&s)?,
                None => PolicyKind::Recompute,
            },
            rate: read_decimal(cfg, "/reconcile/rate")?.unwrap_or(Micros::new(1_000_000)),
            max_parallel_entities: read_u64(cfg, "/reconcile/max_parallel_entities")?
                .unwrap_or(8) as usize,
            serialize_recompute: read_bool(cfg, "/reconcile/serialize_recompute")?.unwrap_or(false),
            dedupe_capacity: read_u64(cfg, "/reconcile/dedupe_capacity")?.unwrap_or(10_000) as usize,
            redeliver_on_total_outage: read_bool(cfg, "/reconcile/redeliver_on_total_outage")?
                .unwrap_or(false),
        };

        let retry = RetrySection {
            max_attempts: read_u32(cfg, "/retry/max_attempts")?.unwrap_or(4),
            base_delay_ms: read_u64(cfg, "/retry/base_delay_ms")?.unwrap_or(200),
            max_delay_ms: read_u64(cfg, "/retry/max_delay_ms")?.unwrap_or(5_000),
            unavailable_ceiling: read_u32(cfg, "/retry/unavailable_ceiling")?.unwrap_or(2),
        };

        let ingress = IngressSection {
            paid_status: read_str(cfg, "/ingress/paid_status")?.unwrap_or_else(|| "paid".to_string()),
            reject_unknown_fields: read_bool(cfg, "/ingress/reject_unknown_fields")?.unwrap_or(false),
        };

        let server = ServerSection {
            bind_addr: read_str(cfg, "/server/bind_addr")?
                .unwrap_or_else(|| "127.0.0.1:3000".to_string()),
            cors_origins: read_str_list(cfg, "/server/cors_origins")?.unwrap_or_default(),
            heartbeat_secs: read_u64(cfg, "/server/heartbeat_secs")?.unwrap_or(15),
        };

        let out = EngineConfig {
            store,
            attribute,
            units_sold,
            reconcile,
            retry,
            ingress,
            server,
        };
        out.validate()?;
        Ok(out)
    }

    fn validate(&self) -> Result<()> {
        if self.reconcile.rate.is_negative() {
            bail!(
                "CONFIG_INVALID /reconcile/rate: rate must be non-negative, got {}",
                self.reconcile.rate
            );
        }
        if self.reconcile.max_parallel_entities == 0 {
            bail!("CONFIG_INVALID /reconcile/max_parallel_entities: must be >= 1");
        }
        if self.reconcile.dedupe_capacity == 0 {
            bail!("CONFIG_INVALID /reconcile/dedupe_capacity: must be >= 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("CONFIG_INVALID /retry/max_attempts: must be >= 1");
        }
        if self.retry.unavailable_ceiling == 0 {
            bail!("CONFIG_INVALID /retry/unavailable_ceiling: must be >= 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "CONFIG_INVALID /retry: base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.store.backend == StoreBackend::Shopify && self.store.resolved_base_url().is_none() {
            bail!("CONFIG_INVALID /store: shopify backend requires shop_domain or base_url");
        }
        if self.ingress.paid_status.is_empty() {
            bail!("CONFIG_INVALID /ingress/paid_status: must not be empty");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pointer readers
// ---------------------------------------------------------------------------

fn read_str(cfg: &Value, pointer: &str) -> Result<Option<String>> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(other) => bail!("CONFIG_INVALID {}: expected string, got {}", pointer, other),
    }
}

fn read_u64(cfg: &Value, pointer: &str) -> Result<Option<u64>> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) => Ok(Some(n)),
            None => bail!("CONFIG_INVALID {}: expected non-negative integer, got {}", pointer, v),
        },
    }
}

fn read_u32(cfg: &Value, pointer: &str) -> Result<Option<u32>> {
    match read_u64(cfg, pointer)? {
        None => Ok(None),
        Some(n) => match u32::try_from(n) {
            Ok(n) => Ok(Some(n)),
            Err(_) => bail!("CONFIG_INVALID {}: {} is out of range", pointer, n),
        },
    }
}

fn read_bool(cfg: &Value, pointer: &str) -> Result<Option<bool>> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => bail!("CONFIG_INVALID {}: expected bool, got {}", pointer, other),
    }
}

/// Decimals may be written as YAML strings (`"1.00"`) or numbers (`1`).
/// Numbers are re-read through their text form; no float arithmetic.
fn read_decimal(cfg: &Value, pointer: &str) -> Result<Option<Micros>> {
    let text = match cfg.pointer(pointer) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => bail!("CONFIG_INVALID {}: expected decimal, got {}", pointer, other),
    };
    match Micros::parse_decimal(&text) {
        Ok(m) => Ok(Some(m)),
        Err(e) => bail!("CONFIG_INVALID {}: {}", pointer, e),
    }
}

fn read_str_list(cfg: &Value, pointer: &str) -> Result<Option<Vec<String>>> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(s) => out.push(s.trim().to_string()),
                    None => bail!("CONFIG_INVALID {}/{}: expected string, got {}", pointer, i, item),
                }
            }
            Ok(Some(out))
        }
        Some(other) => bail!("CONFIG_INVALID {}: expected list of strings, got {}", pointer, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_cfg() -> Value {
        serde_json::json!({ "store": { "backend": "memory" } })
    }

    #[test]
    fn defaults_apply_for_memory_backend() {
        let cfg = EngineConfig::from_json(&memory_cfg()).unwrap();
        assert_eq!(cfg.reconcile.policy, PolicyKind::Recompute);
        assert_eq!(cfg.reconcile.rate, Micros::new(1_000_000));
        assert_eq!(cfg.attribute.namespace, DEFAULT_NAMESPACE);
        assert_eq!(cfg.attribute.key, DEFAULT_KEY);
        assert_eq!(cfg.units_sold.namespace, DEFAULT_NAMESPACE);
        assert_eq!(cfg.units_sold.key, DEFAULT_UNITS_SOLD_KEY);
        assert_eq!(cfg.ingress.paid_status, "paid");
        assert_eq!(cfg.retry.max_attempts, 4);
    }

    #[test]
    fn shopify_backend_requires_domain() {
        let err = EngineConfig::from_json(&serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("shop_domain"), "{err}");
    }

    #[test]
    fn base_url_overrides_domain() {
        let cfg = EngineConfig::from_json(&serde_json::json!({
            "store": { "shop_domain": "a.myshopify.com", "base_url": "http://127.0.0.1:9999/" }
        }))
        .unwrap();
        assert_eq!(
            cfg.store.resolved_base_url().as_deref(),
            Some("http://127.0.0.1:9999")
        );
    }

    #[test]
    fn numeric_rate_is_read_exactly() {
        let cfg = EngineConfig::from_json(&serde_json::json!({
            "store": { "backend": "memory" },
            "reconcile": { "rate": 2.5 }
        }))
        .unwrap();
        assert_eq!(cfg.reconcile.rate, Micros::new(2_500_000));
    }

    #[test]
    fn negative_rate_is_refused() {
        let err = EngineConfig::from_json(&serde_json::json!({
            "store": { "backend": "memory" },
            "reconcile": { "rate": "-1" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("non-negative"), "{err}");
    }

    #[test]
    fn wrong_type_is_refused_not_defaulted() {
        let err = EngineConfig::from_json(&serde_json::json!({
            "store": { "backend": "memory" },
            "retry": { "max_attempts": "four" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("/retry/max_attempts"), "{err}");
    }

    #[test]
    fn unknown_policy_is_refused() {
        let err = EngineConfig::from_json(&serde_json::json!({
            "store": { "backend": "memory" },
            "reconcile": { "policy": "sum" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown policy"), "{err}");
    }
}
