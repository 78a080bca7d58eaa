use crate::error::{Result, ShardgateError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable opaque shard name. Never a host or port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub const CONFIG: &'static str = "config";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn config() -> Self {
        Self(Self::CONFIG.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_config(&self) -> bool {
        self.0 == Self::CONFIG
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// `db.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn parse(full: &str) -> Result<Self> {
        match full.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(ShardgateError::BadValue(format!(
                "invalid namespace '{full}', expected <db>.<collection>"
            ))),
        }
    }

    /// Lock resource name used by the distributed lock manager.
    pub fn lock_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaces() {
        let ns = Namespace::parse("shop.orders.archive").unwrap();
        assert_eq!(ns.db, "shop");
        assert_eq!(ns.coll, "orders.archive");
        assert_eq!(ns.to_string(), "shop.orders.archive");
        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
    }
}
