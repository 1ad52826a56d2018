//! Admin GraphQL backed attribute store.
//!
//! One round trip per entity per operation:
//! - `get` / `units_sold`: `product(id) { metafield(namespace, key) { value } }`
//! - `set`: `metafieldsSet` with `ownerId = gid://shopify/Product/{id}`
//!
//! Access token is passed in by the caller (runtime wiring); do not log it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tally_schemas::{AttributeRef, EntityId, Micros};
use tracing::debug;

use crate::{AttributeStore, StoreError, UnitsSoldSource};

const GET_METAFIELD_QUERY: &str = r#"
query TallyGetMetafield($id: ID!, $namespace: String!, $key: String!) {
  product(id: $id) {
    metafield(namespace: $namespace, key: $key) {
      value
    }
  }
}
"#;

const SET_METAFIELD_MUTATION: &str = r#"
mutation TallySetMetafield($metafields: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $metafields) {
    metafields {
      id
    }
    userErrors {
      field
      message
    }
  }
}
"#;

/// Longest slice of an error body carried into a [`StoreError`].
const MAX_BODY_EXCERPT: usize = 512;

#[derive(Clone)]
pub struct ShopifyStoreConfig {
    /// Origin of the shop, e.g. `https://example.myshopify.com`.
    pub base_url: String,
    pub api_version: String,
    pub access_token: String,
    /// The contribution-total metafield.
    pub attribute: AttributeRef,
    /// Metafield type written with the total (e.g. `number_decimal`).
    pub value_type: String,
    /// Counter metafield read by [`UnitsSoldSource`]; `None` disables it.
    /// Read only: keeping it current is up to whatever records sales.
    pub units_sold: Option<AttributeRef>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ShopifyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopifyStoreConfig")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("access_token", &"<REDACTED>")
            .field("attribute", &self.attribute)
            .field("value_type", &self.value_type)
            .field("units_sold", &self.units_sold)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ShopifyAdminStore {
    cfg: ShopifyStoreConfig,
    http: reqwest::Client,
    endpoint: String,
}

impl ShopifyAdminStore {
    pub fn new(cfg: ShopifyStoreConfig) -> Result<Self, StoreError> {
        if cfg.access_token.trim().is_empty() {
            return Err(StoreError::Config("admin access token is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| StoreError::Config(format!("http client build failed: {e}")))?;
        let endpoint = format!(
            "{}/admin/api/{}/graphql.json",
            cfg.base_url.trim_end_matches('/'),
            cfg.api_version
        );
        Ok(Self {
            cfg,
            http,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn owner_gid(entity: &EntityId) -> String {
        format!("gid://shopify/Product/{}", entity.as_str())
    }

    /// POST one GraphQL document and return its `data` member.
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, StoreError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.cfg.access_token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body));
        }

        let body: GraphQlResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("graphql response json decode failed: {e}")))?;

        if let Some(err) = body.first_error() {
            return Err(err);
        }

        body.data
            .ok_or_else(|| StoreError::Decode("graphql response has no data".to_string()))
    }

    /// Read a product metafield's raw value. `Ok(None)` when unset.
    async fn read_metafield(
        &self,
        entity: &EntityId,
        attr: &AttributeRef,
    ) -> Result<Option<String>, StoreError> {
        let data = self
            .execute(
                GET_METAFIELD_QUERY,
                json!({
                    "id": Self::owner_gid(entity),
                    "namespace": attr.namespace,
                    "key": attr.key,
                }),
            )
            .await?;

        let product = data.get("product").unwrap_or(&Value::Null);
        if product.is_null() {
            return Err(StoreError::Rejected {
                status: None,
                message: format!("product {} not found", entity),
            });
        }

        match product.get("metafield") {
            None | Some(Value::Null) => Ok(None),
            Some(mf) => match mf.get("value") {
                Some(Value::String(s)) => Ok(Some(s.clone())),
                None | Some(Value::Null) => Ok(None),
                Some(other) => Err(StoreError::Decode(format!(
                    "metafield {} value is not a string: {}",
                    attr, other
                ))),
            },
        }
    }
}

#[async_trait::async_trait]
impl AttributeStore for ShopifyAdminStore {
    fn name(&self) -> &'static str {
        "shopify"
    }

    fn attribute(&self) -> &AttributeRef {
        &self.cfg.attribute
    }

    async fn get(&self, entity: &EntityId) -> Result<Option<Micros>, StoreError> {
        let raw = self.read_metafield(entity, &self.cfg.attribute).await?;
        debug!(entity_id = %entity, attribute = %self.cfg.attribute, raw = ?raw, "metafield read");
        match raw {
            None => Ok(None),
            Some(s) => Micros::parse_decimal(&s).map(Some).map_err(|e| {
                StoreError::Decode(format!(
                    "stored value for {} on product {} is not a decimal: {}",
                    self.cfg.attribute, entity, e
                ))
            }),
        }
    }

    async fn set(&self, entity: &EntityId, value: Micros) -> Result<(), StoreError> {
        let variables = json!({
            "metafields": [{
                "ownerId": Self::owner_gid(entity),
                "namespace": self.cfg.attribute.namespace,
                "key": self.cfg.attribute.key,
                "value": value.to_string(),
                "type": self.cfg.value_type,
            }]
        });
        let data = self.execute(SET_METAFIELD_MUTATION, variables).await?;

        let payload: MetafieldsSetPayload = serde_json::from_value(
            data.get("metafieldsSet").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| StoreError::Decode(format!("metafieldsSet payload decode failed: {e}")))?;

        if !payload.user_errors.is_empty() {
            let msg = payload
                .user_errors
                .iter()
                .map(|u| match &u.field {
                    Some(field) => format!("{}: {}", field.join("."), u.message),
                    None => u.message.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StoreError::Rejected {
                status: None,
                message: msg,
            });
        }

        debug!(entity_id = %entity, attribute = %self.cfg.attribute, value = %value, "metafield written");
        Ok(())
    }
}

#[async_trait::async_trait]
impl UnitsSoldSource for ShopifyAdminStore {
    async fn units_sold(&self, entity: &EntityId) -> Result<Option<u64>, StoreError> {
        let attr = self.cfg.units_sold.as_ref().ok_or_else(|| {
            StoreError::Config("no units-sold counter metafield configured".to_string())
        })?;
        let raw = self.read_metafield(entity, attr).await?;
        match raw {
            None => Ok(None),
            Some(s) => s.trim().parse::<u64>().map(Some).map_err(|_| {
                StoreError::Decode(format!(
                    "units-sold counter {} on product {} is not a non-negative integer: '{}'",
                    attr, entity, s
                ))
            }),
        }
    }
}

/// Map a non-2xx HTTP status to the store taxonomy.
fn classify_http_status(status: u16, body: &str) -> StoreError {
    let message = excerpt(body);
    match status {
        429 => StoreError::RateLimited(format!("http 429: {message}")),
        500..=599 => StoreError::Unavailable {
            status: Some(status),
            message,
        },
        _ => StoreError::Rejected {
            status: Some(status),
            message,
        },
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_BODY_EXCERPT {
        return trimmed.to_string();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    /// Top-level GraphQL errors. Throttling is reported here with HTTP 200.
    fn first_error(&self) -> Option<StoreError> {
        if self.errors.is_empty() {
            return None;
        }
        let throttled = self.errors.iter().any(|e| {
            e.extensions
                .as_ref()
                .and_then(|x| x.code.as_deref())
                .map(|c| c == "THROTTLED")
                .unwrap_or(false)
        });
        let message = self
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Some(if throttled {
            StoreError::RateLimited(message)
        } else {
            StoreError::Rejected {
                status: None,
                message,
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: Option<GraphQlErrorExtensions>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorExtensions {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetPayload {
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
struct UserError {
    field: Option<Vec<String>>,
    message: String,
}
