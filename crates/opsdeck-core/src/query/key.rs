use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a cached collection view: collection name plus filter
/// parameters.
///
/// Parameters live in a `BTreeMap`, so two keys built with the same filters
/// in a different order are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub collection: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl QueryKey {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn is_collection(&self, collection: &str) -> bool {
        self.collection == collection
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.collection)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}
