//! Scenario: backend-aware secret resolution.
//!
//! All failure tests use globally-unique sentinel env var names that are
//! never set in any CI or dev environment, so no test mutates the process
//! environment.

use tally_config::secrets::resolve_secrets;
use tally_config::{load_layered_yaml_from_strings, EngineConfig};

fn engine(yaml: &str) -> EngineConfig {
    let loaded = load_layered_yaml_from_strings(&[yaml]).expect("test yaml must parse cleanly");
    EngineConfig::from_json(&loaded.config_json).expect("test config must be valid")
}

#[test]
fn shopify_backend_fails_closed_without_token() {
    let cfg = engine(
        r#"
store:
  backend: "shopify"
  shop_domain: "example.myshopify.com"
  access_token_env: "TALLY_SENTINEL_TOKEN_MISSING_A1"
"#,
    );
    let err = resolve_secrets(&cfg).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("SECRETS_MISSING"), "{msg}");
    assert!(
        msg.contains("TALLY_SENTINEL_TOKEN_MISSING_A1"),
        "error must name the variable: {msg}"
    );
}

#[test]
fn memory_backend_needs_no_secrets() {
    let cfg = engine(
        r#"
store:
  backend: "memory"
  access_token_env: "TALLY_SENTINEL_TOKEN_MISSING_B2"
"#,
    );
    let secrets = resolve_secrets(&cfg).unwrap();
    assert!(secrets.store_access_token.is_none());
}

#[test]
fn debug_output_is_redacted() {
    let secrets = tally_config::secrets::ResolvedSecrets {
        store_access_token: Some("not-a-real-token-value".to_string()),
    };
    let dbg = format!("{secrets:?}");
    assert!(dbg.contains("<REDACTED>"));
    assert!(!dbg.contains("not-a-real-token-value"));
}
