//! Static enrichment fields merged into every emitted event.

use std::sync::Arc;

use crate::event::Metadata;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata unavailable: {0}")]
    Unavailable(String),
}

/// Supplies fields such as pod or node identity.
///
/// Called on the emitting thread for every event, so implementations should return cached data.
/// An error skips enrichment for that one event; emission continues.
pub trait MetadataProvider: Send + Sync + std::fmt::Debug {
    fn fields(&self) -> Result<Arc<Metadata>, MetadataError>;
}

/// Fixed set of fields.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    fields: Arc<Metadata>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.fields).insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for StaticMetadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { fields: Arc::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect()) }
    }
}

impl MetadataProvider for StaticMetadata {
    fn fields(&self) -> Result<Arc<Metadata>, MetadataError> {
        Ok(self.fields.clone())
    }
}
