//! Registry of named table-provisioning procedures.
//!
//! Creators are registered on a [`SchemaRegistryBuilder`] at startup. The
//! built [`SchemaRegistry`] is immutable and shared with the router by `Arc`.

use async_trait::async_trait;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StratumError};

/// An idempotent procedure that creates the tables one capability needs.
///
/// `create` runs on a connection whose `search_path` is the target tenant's
/// schema, inside a transaction owned by the caller. Implementations must be
/// safe to re-run (`CREATE ... IF NOT EXISTS`, `CREATE OR REPLACE`).
#[async_trait]
pub trait SchemaCreator: Send + Sync {
    async fn create(&self, conn: &mut PgConnection) -> Result<()>;
}

/// Builder for [`SchemaRegistry`].
#[derive(Default)]
pub struct SchemaRegistryBuilder {
    creators: BTreeMap<String, Arc<dyn SchemaCreator>>,
}

impl SchemaRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a creator under a capability name.
    ///
    /// Registering the same name twice is a startup bug and is rejected.
    pub fn register_schema_creator<C>(mut self, name: impl Into<String>, creator: C) -> Result<Self>
    where
        C: SchemaCreator + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StratumError::invalid_argument(
                "schema creator name must not be empty",
            ));
        }
        if self.creators.contains_key(&name) {
            return Err(StratumError::invalid_argument(format!(
                "schema creator already registered: {}",
                name
            )));
        }
        self.creators.insert(name, Arc::new(creator));
        Ok(self)
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            creators: self.creators,
        }
    }
}

/// Immutable lookup of schema creators by name.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    creators: BTreeMap<String, Arc<dyn SchemaCreator>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::new()
    }

    /// Look up a creator, `NotFound` when nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SchemaCreator>> {
        self.creators
            .get(name)
            .cloned()
            .ok_or_else(|| StratumError::not_found("schema creator", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    /// Registered names, in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.creators.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.creators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("creators", &self.creators.keys().collect::<Vec<_>>())
            .finish()
    }
}
