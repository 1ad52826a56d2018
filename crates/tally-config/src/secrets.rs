//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (e.g.
//!   `store.access_token_env: "SHOPIFY_ADMIN_API_ACCESS_TOKEN"`).
//! - At startup, callers invoke [`resolve_secrets`] once and pass the
//!   returned [`ResolvedSecrets`] into constructors; nothing else reads
//!   `std::env` for credentials.
//! - `Debug` output redacts values.
//! - Error messages reference the env var **NAME**, never the value.
//!
//! # Backend-aware enforcement
//! - `shopify`: the Admin API access token is **required**.
//! - `memory`:  nothing is required.

use anyhow::{bail, Result};

use crate::engine::{EngineConfig, StoreBackend};

/// All runtime-resolved secrets for one engine instantiation.
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Admin API access token. `None` if the named env var was absent or empty.
    pub store_access_token: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "store_access_token",
                &self.store_access_token.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Resolve a named environment variable.
/// Returns `None` if the variable is unset or its value is blank.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Resolve all secrets the configured backend needs.
///
/// # Errors
/// `SECRETS_MISSING` naming the env var (never its value) when the shopify
/// backend is selected and the access token variable is unset or blank.
pub fn resolve_secrets(cfg: &EngineConfig) -> Result<ResolvedSecrets> {
    let var = cfg.store.access_token_env.as_str();
    let store_access_token = resolve_env(var);

    match cfg.store.backend {
        StoreBackend::Shopify => {
            if store_access_token.is_none() {
                bail!(
                    "SECRETS_MISSING backend=shopify: required env var '{}' \
                     (Admin API access token) is not set or empty",
                    var,
                );
            }
        }
        StoreBackend::Memory => {}
    }

    Ok(ResolvedSecrets { store_access_token })
}
