//! Shard identifiers and the tenant context requests carry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Identifier of a physical storage shard.
///
/// Cheap to clone; shard ids are passed around on every request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId(Arc<str>);

impl ShardId {
    /// Shard holding platform-wide records and the shard-assignment table.
    pub const GLOBAL: &'static str = "global";
    /// Shard for tenants that have not been assigned a dedicated shard yet.
    pub const PLACEHOLDER: &'static str = "placeholder";
    /// Shard used while a tenant's data is being moved between shards.
    pub const PROVISIONAL: &'static str = "provisional";

    /// Parses and validates a shard id: lowercase ascii, digits, `-` and `_`.
    pub fn new(id: impl AsRef<str>) -> Result<Self> {
        let id = id.as_ref();
        let valid = !id.is_empty()
            && id.len() <= 63
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(CoreError::invalid_shard_id(id));
        }
        Ok(Self(Arc::from(id)))
    }

    pub fn global() -> Self {
        Self(Arc::from(Self::GLOBAL))
    }

    pub fn placeholder() -> Self {
        Self(Arc::from(Self::PLACEHOLDER))
    }

    pub fn provisional() -> Self {
        Self(Arc::from(Self::PROVISIONAL))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the global, placeholder and provisional shards.
    pub fn is_well_known(&self) -> bool {
        matches!(
            self.as_str(),
            Self::GLOBAL | Self::PLACEHOLDER | Self::PROVISIONAL
        )
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ShardId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ShardId> for String {
    fn from(value: ShardId) -> Self {
        value.0.to_string()
    }
}

impl AsRef<str> for ShardId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Who a request is acting for.
///
/// `tenant == None` is the platform/system context, which may only touch
/// platform-scoped resource types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TenantContext {
    tenant: Option<String>,
}

impl TenantContext {
    pub fn system() -> Self {
        Self { tenant: None }
    }

    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant_id.into()),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn is_system(&self) -> bool {
        self.tenant.is_none()
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant {
            Some(t) => write!(f, "tenant:{t}"),
            None => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_validation() {
        assert!(ShardId::new("tenant-a_01").is_ok());
        assert!(ShardId::new("").is_err());
        assert!(ShardId::new("Upper").is_err());
        assert!(ShardId::new("has space").is_err());
        assert!(ShardId::new("semi;colon").is_err());
    }

    #[test]
    fn test_well_known_shards() {
        assert!(ShardId::global().is_well_known());
        assert!(ShardId::placeholder().is_well_known());
        assert!(ShardId::provisional().is_well_known());
        assert!(!ShardId::new("shard-7").unwrap().is_well_known());
        assert_eq!(ShardId::global().to_string(), "global");
    }

    #[test]
    fn test_shard_id_serde() {
        let id: ShardId = serde_json::from_str("\"shard-2\"").unwrap();
        assert_eq!(id.as_str(), "shard-2");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"shard-2\"");
        assert!(serde_json::from_str::<ShardId>("\"BAD\"").is_err());
    }

    #[test]
    fn test_tenant_context() {
        let ctx = TenantContext::tenant("acme");
        assert_eq!(ctx.tenant_id(), Some("acme"));
        assert!(!ctx.is_system());
        assert_eq!(ctx.to_string(), "tenant:acme");
        assert!(TenantContext::system().is_system());
        assert_eq!(TenantContext::system().to_string(), "system");
    }
}
