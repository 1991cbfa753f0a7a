use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header carrying the sender's hex-encoded public key.
pub const IDENTITY: &str = "identity";

/// Header carrying the base64 detached signature over the payload.
pub const SIGNATURE: &str = "signature";

/// Header carrying the send time in unix nanoseconds.
pub const TIMESTAMP: &str = "timestamp";

/// Header marking a reply as an error envelope.
pub const RPC_STATUS: &str = "rpc-status";

/// Value of [`RPC_STATUS`] for error envelopes.
pub const RPC_STATUS_ERROR: &str = "error";

/// Multi-valued string headers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap(BTreeMap<String, Vec<String>>);

impl HeaderMap {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every value of `key` with `value`.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Adds `value` to the values of `key`.
    pub fn append<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of `key`.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map_or(&[], Vec::as_slice)
    }

    /// Removes `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Overwrites entries of `self` with the entries of `other`.
    pub fn merge(&mut self, other: &Self) {
        for (key, values) in &other.0 {
            self.0.insert(key.clone(), values.clone());
        }
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over keys and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (key, value) in iter {
            headers.append(key, value);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
