use serde::{Deserialize, Serialize};

/// Identifier of a tracked commerce entity (a product).
///
/// Always the platform's bare id in canonical text form (`"789"`), never a
/// global id like `gid://shopify/Product/789`; adapters build those.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Build an entity id, trimming surrounding whitespace.
    ///
    /// Rejects empty ids and ids containing `/` (which would break the
    /// adapter's owner-id construction).
    pub fn new(raw: impl AsRef<str>) -> Result<Self, EntityIdError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(EntityIdError::Empty);
        }
        if trimmed.contains('/') {
            return Err(EntityIdError::Invalid {
                raw: trimmed.to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityIdError {
    Empty,
    Invalid { raw: String },
}

impl std::fmt::Display for EntityIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityIdError::Empty => write!(f, "entity id is empty"),
            EntityIdError::Invalid { raw } => write!(f, "entity id '{raw}' contains '/'"),
        }
    }
}

impl std::error::Error for EntityIdError {}

/// The `(namespace, key)` pair addressing one numeric attribute on an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRef {
    pub namespace: String,
    pub key: String,
}

impl AttributeRef {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.key)
    }
}
