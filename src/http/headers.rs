//! HTTP header map with case-insensitive name lookup.
//!
//! Headers are multi-valued and order-preserving. For persistence they are
//! folded into a lowercase-name → ordered-values map (see [`Headers::to_multi_map`]).

use std::collections::BTreeMap;
use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use fetch_cache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Set-Cookie", "a=1");
/// headers.insert("set-cookie", "b=2");
///
/// assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
/// assert_eq!(headers.get_joined("set-cookie").as_deref(), Some("a=1, b=2"));
/// assert_eq!(headers.to_multi_map()["set-cookie"], vec!["a=1", "b=2"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Rebuilds a header map from its persisted lowercase multi-valued form.
    pub fn from_multi_map(map: &BTreeMap<String, Vec<String>>) -> Self {
        let mut headers = Self::with_capacity(map.values().map(Vec::len).sum());
        for (name, values) in map {
            for value in values {
                headers.insert(name.as_str(), value.as_str());
            }
        }
        headers
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name` joined with `", "`, the way fetch-style
    /// header maps report multi-valued fields.
    pub fn get_joined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self.get_all(name).collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns `(lowercase name, joined values)` pairs sorted by name.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.to_multi_map()
            .into_iter()
            .map(|(name, values)| (name, values.join(", ")))
            .collect()
    }

    /// Folds the entries into a lowercase-name map of ordered values.
    pub fn to_multi_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.inner {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn multi_map_round_trip() {
        let h: Headers = [("X-A", "1"), ("x-a", "2"), ("Content-Length", "5")]
            .into_iter()
            .collect();
        let map = h.to_multi_map();
        assert_eq!(map["x-a"], vec!["1", "2"]);
        assert_eq!(map["content-length"], vec!["5"]);

        let rebuilt = Headers::from_multi_map(&map);
        assert_eq!(rebuilt.to_multi_map(), map);
        assert_eq!(rebuilt.get("X-A"), Some("1"));
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        h.insert("x-foo", "baz");
        h.set("X-Foo", "qux");
        assert_eq!(h.get_all("x-foo").collect::<Vec<_>>(), vec!["qux"]);
    }

    #[test]
    fn multi_map_folds_names_to_lowercase() {
        let h: Headers = [("Vary", "Accept"), ("VARY", "Origin")].into_iter().collect();
        let map = h.to_multi_map();
        assert_eq!(map["vary"], vec!["Accept".to_owned(), "Origin".to_owned()]);
        assert_eq!(h.entries(), vec![("vary".to_owned(), "Accept, Origin".to_owned())]);
        assert_eq!(h.get_joined("missing"), None);
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo"));
    }
}
