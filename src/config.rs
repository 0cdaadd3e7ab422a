//! Store configuration.
//!
//! Every field has a default, so an empty JSON object (or
//! [`StoreConfig::default`]) gives an unbounded store that creates
//! collections on first use.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings applied by a [`crate::Store`] to every collection it owns.
///
/// # Example
///
/// ```json
/// {
///   "auto_create_collections": false,
///   "max_documents_per_collection": 10000,
///   "initial_capacity": 256
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Create a collection the first time it is named. When off, naming an
    /// unknown collection fails with [`Error::CollectionNotFound`].
    pub auto_create_collections: bool,
    /// Upper bound on documents per collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_documents_per_collection: Option<usize>,
    /// Pre-allocated document slots for new collections.
    pub initial_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_create_collections: true,
            max_documents_per_collection: None,
            initial_capacity: 0,
        }
    }
}

impl StoreConfig {
    /// Parse and validate a config from JSON text.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: StoreConfig =
            serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_documents_per_collection == Some(0) {
            return Err(Error::Config(
                "max_documents_per_collection must be greater than 0".into(),
            ));
        }
        if let Some(max) = self.max_documents_per_collection {
            if self.initial_capacity > max {
                return Err(Error::Config(format!(
                    "initial_capacity ({}) exceeds max_documents_per_collection ({max})",
                    self.initial_capacity
                )));
            }
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
