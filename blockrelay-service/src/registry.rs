//! Resolution of public object references.
//!
//! Download URLs carry an opaque object reference. A [`Registry`] maps it to the [`Locator`] of
//! the stored object and describes the object's size, name and media type.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::ShardId;
use crate::locator::{Locator, LocatorError};

/// Declared properties of a stored object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Total size of the object in bytes.
    pub size: u64,
    /// Display name of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared media type of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// A registry entry as stored in configuration or a registry file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// The encoded [`Locator`] of the object.
    pub file_id: String,
    /// Total size of the object in bytes.
    pub size: u64,
    /// Display name of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared media type of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// Errors raised while resolving objects.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The object reference is unknown.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A stored file id could not be decoded.
    #[error("invalid file id")]
    Locator(#[from] LocatorError),

    /// Two references declare different properties for the same stored object.
    #[error("conflicting declarations for stored object {0}")]
    Conflict(String),

    /// The registry file could not be read.
    #[error("failed to read registry file")]
    Io(#[from] std::io::Error),

    /// The registry file is not valid JSON.
    #[error("serde error: {context}")]
    Serde {
        /// What was being parsed.
        context: String,
        /// The underlying serde error.
        #[source]
        cause: serde_json::Error,
    },
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Maps object references to stored objects.
#[async_trait::async_trait]
pub trait Registry: Debug + Send + Sync + 'static {
    /// Resolves a public object reference into the locator of the stored object.
    async fn resolve(&self, object_ref: &str) -> RegistryResult<Locator>;

    /// Returns the declared properties of the object at `locator`.
    async fn describe(&self, locator: &Locator) -> RegistryResult<Descriptor>;
}

/// A registry over a fixed set of objects.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    locators: HashMap<String, Locator>,
    descriptors: HashMap<(ShardId, u64), Descriptor>,
}

impl StaticRegistry {
    /// Builds a registry from records keyed by object reference.
    ///
    /// Declared properties belong to the stored object, so several references may point at the
    /// same object only if they declare identical size, name and media type.
    ///
    /// Fails if any record carries an undecodable file id or conflicting declarations.
    pub fn new(records: BTreeMap<String, ObjectRecord>) -> RegistryResult<Self> {
        let mut registry = Self::default();

        for (object_ref, record) in records {
            let locator = Locator::decode(&record.file_id)?;
            let descriptor = Descriptor {
                size: record.size,
                name: record.name,
                media_type: record.media_type,
            };

            match registry.descriptors.entry((locator.shard, locator.object_id)) {
                Entry::Occupied(existing) if *existing.get() != descriptor => {
                    return Err(RegistryError::Conflict(object_ref));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(descriptor);
                }
            }
            registry.locators.insert(object_ref, locator);
        }

        Ok(registry)
    }

    /// Reads records from a JSON file containing an object keyed by object reference.
    pub async fn read_records(path: &Path) -> RegistryResult<BTreeMap<String, ObjectRecord>> {
        let contents = tokio::fs::read(path).await?;
        serde_json::from_slice(&contents).map_err(|cause| RegistryError::Serde {
            context: format!("failed to parse {}", path.display()),
            cause,
        })
    }

    /// Returns the number of registered objects.
    pub fn len(&self) -> usize {
        self.locators.len()
    }

    /// Returns `true` if no object is registered.
    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }
}

#[async_trait::async_trait]
impl Registry for StaticRegistry {
    async fn resolve(&self, object_ref: &str) -> RegistryResult<Locator> {
        self.locators
            .get(object_ref)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(object_ref.to_owned()))
    }

    async fn describe(&self, locator: &Locator) -> RegistryResult<Descriptor> {
        self.descriptors
            .get(&(locator.shard, locator.object_id))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{}", locator.shard, locator.object_id)))
    }
}
