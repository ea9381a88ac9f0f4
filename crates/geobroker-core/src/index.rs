//! Region index cache.
//!
//! Named feature collections held by an execution context so repeated
//! identify requests can reference a collection instead of re-sending it.
//! Loading replaces any prior contents under the same name; there is no
//! eviction beyond explicit clear.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::geometry::Feature;

/// Named feature collections.
#[derive(Debug, Clone, Default)]
pub struct RegionIndex {
    datasets: HashMap<String, Arc<[Feature]>>,
}

impl RegionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `features` under `name`, replacing previous contents.
    ///
    /// Returns the number of features stored.
    pub fn load(
        &mut self,
        name: impl Into<String>,
        features: impl Into<Arc<[Feature]>>,
    ) -> usize {
        let name = name.into();
        let features = features.into();
        let count = features.len();
        let replaced = self.datasets.insert(name.clone(), features).is_some();
        debug!(name = %name, count, replaced, "Region index loaded");
        count
    }

    /// Get the collection stored under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<[Feature]>> {
        self.datasets.get(name).cloned()
    }

    /// Remove one collection, or all of them when `name` is `None`.
    ///
    /// Returns the number of collections removed.
    pub fn clear(&mut self, name: Option<&str>) -> usize {
        match name {
            Some(name) => usize::from(self.datasets.remove(name).is_some()),
            None => {
                let removed = self.datasets.len();
                self.datasets.clear();
                removed
            }
        }
    }

    /// Sorted collection names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Iterate over all stored collections.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<[Feature]>)> {
        self.datasets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of stored collections.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}
