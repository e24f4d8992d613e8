//! Cache keys and the filter parameters they are derived from.
//!
//! A [`CacheKey`] is the canonical form of a `(resource, filters)` pair. Two filter sets holding the same
//! name/value pairs produce the same key no matter in what order they were assembled. Values of set-like filters
//! (selected colors, sizes, category lists) are sorted and de-duplicated before encoding. Parameters with no value
//! are simply never inserted, so "absent" and "not set" are indistinguishable, while an explicit
//! [`FilterValue::Null`] survives into the key.

use crate::error::CacheError;
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, fmt::{Debug, Display}, hash::{Hash, Hasher}, sync::Arc};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Order-insensitive collection.
    Set(Vec<FilterValue>),
    /// Order-sensitive collection.
    List(Vec<FilterValue>),
}

impl FilterValue {
    /// Build a set value. Element order does not matter, duplicates are dropped.
    pub fn set<T, I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FilterValue>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn list<T, I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FilterValue>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn canonical(&self) -> Result<Value, CacheError> {
        Ok(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => json!(b),
            Self::Int(i) => json!(i),
            Self::Float(f) => {
                if !f.is_finite() {
                    return Err(CacheError::InvalidQuery(format!("non-finite number {f} in filters")));
                }
                json!(f)
            }
            Self::Text(s) => json!(s),
            Self::Set(items) => {
                let mut items = items.iter().map(|i| i.canonical()).collect::<Result<Vec<_>, _>>()?;
                items.sort_by_cached_key(|v| v.to_string());
                items.dedup();
                json!({ "set": items })
            }
            Self::List(items) => Value::Array(items.iter().map(|i| i.canonical()).collect::<Result<_, _>>()?),
        })
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for FilterValue {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for FilterValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

/// Named filter parameters of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterParams {
    params: BTreeMap<String, FilterValue>,
}

impl FilterParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<V: Into<FilterValue>>(mut self, name: &str, value: V) -> Self {
        self.insert(name, value);
        self
    }

    /// Same as [`with`](Self::with) but `None` leaves the parameter out.
    pub fn with_opt<V: Into<FilterValue>>(mut self, name: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(name, value);
        }
        self
    }

    pub fn insert<V: Into<FilterValue>>(&mut self, name: &str, value: V) -> Option<FilterValue> {
        self.params.insert(name.to_string(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<FilterValue> {
        self.params.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&FilterValue> {
        self.params.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn canonical(&self) -> Result<Value, CacheError> {
        let mut map = Map::new();
        // BTreeMap iteration is already sorted by name.
        for (name, value) in self.params.iter() {
            map.insert(name.clone(), value.canonical()?);
        }
        Ok(Value::Object(map))
    }
}

impl<K, V> FromIterator<(K, V)> for FilterParams
where
    K: Into<String>,
    V: Into<FilterValue>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            params: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

struct KeyData {
    canonical: String,
    resource:  String,
    params:    FilterParams,
}

/// Canonical identifier of a cached query.
///
/// Equality and hashing only look at the canonical encoding. The resource name and the filters are kept alongside
/// so that the cache can rebuild a data source request from the key alone.
#[derive(Clone)]
pub struct CacheKey {
    inner: Arc<KeyData>,
}

impl CacheKey {
    pub fn derive(resource: &str, params: &FilterParams) -> Result<Self, CacheError> {
        Self::validate_resource(resource)?;

        let canonical = json!([resource, params.canonical()?]).to_string();

        Ok(Self {
            inner: Arc::new(KeyData {
                canonical,
                resource: resource.to_string(),
                params: params.clone(),
            }),
        })
    }

    /// Key of a resource queried without any filters.
    pub fn of(resource: &str) -> Result<Self, CacheError> {
        Self::derive(resource, &FilterParams::new())
    }

    fn validate_resource(resource: &str) -> Result<(), CacheError> {
        if resource.is_empty() {
            return Err(CacheError::InvalidQuery("resource name cannot be empty".into()));
        }
        if !resource
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(CacheError::InvalidQuery(format!(
                "resource name '{resource}' is not an identifier"
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    #[inline]
    pub fn params(&self) -> &FilterParams {
        &self.inner.params
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.inner.canonical
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.canonical == other.inner.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.canonical.hash(state);
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.canonical)
    }
}

impl Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CacheKey").field(&self.inner.canonical).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(resource: &str, params: FilterParams) -> CacheKey {
        CacheKey::derive(resource, &params).unwrap()
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = key("products", FilterParams::new().with("a", 1).with("b", 2));
        let b = key("products", FilterParams::new().with("b", 2).with("a", 1));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn sets_are_order_insensitive() {
        let a = key("products", FilterParams::new().with("colors", FilterValue::set(["red", "blue"])));
        let b = key("products", FilterParams::new().with("colors", FilterValue::set(["blue", "red"])));
        let c = key(
            "products",
            FilterParams::new().with("colors", FilterValue::set(["blue", "red", "blue"])),
        );
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn lists_keep_their_order() {
        let a = key("products", FilterParams::new().with("path", FilterValue::list(["a", "b"])));
        let b = key("products", FilterParams::new().with("path", FilterValue::list(["b", "a"])));
        assert_ne!(a, b);
    }

    #[test]
    fn absent_and_null_differ() {
        let absent = key("products", FilterParams::new().with_opt::<&str>("store_id", None));
        let empty = key("products", FilterParams::new());
        let null = key("products", FilterParams::new().with("store_id", FilterValue::Null));
        assert_eq!(absent, empty);
        assert_ne!(absent, null);
    }

    #[test]
    fn differing_values_never_collide() {
        let base = key("products", FilterParams::new().with("page", 1));
        assert_ne!(base, key("products", FilterParams::new().with("page", 2)));
        assert_ne!(base, key("products", FilterParams::new().with("page", "1")));
        assert_ne!(base, key("products", FilterParams::new().with("page", 1.0)));
        assert_ne!(base, key("stores", FilterParams::new().with("page", 1)));
        assert_ne!(
            key("products", FilterParams::new().with("tags", FilterValue::set(["a", "b"]))),
            key("products", FilterParams::new().with("tags", FilterValue::list(["a", "b"])))
        );
        // Quoting must keep crafted strings apart from structured values.
        assert_ne!(
            key("products", FilterParams::new().with("search", "a\",\"b")),
            key("products", FilterParams::new().with("search", "a").with("b", "")),
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            CacheKey::derive("", &FilterParams::new()),
            Err(CacheError::InvalidQuery(_))
        ));
        assert!(matches!(
            CacheKey::derive("prod ucts", &FilterParams::new()),
            Err(CacheError::InvalidQuery(_))
        ));
        assert!(matches!(
            CacheKey::derive("products", &FilterParams::new().with("min_price", f64::NAN)),
            Err(CacheError::InvalidQuery(_))
        ));
    }

    #[test]
    fn key_keeps_its_origin() {
        let k = key("stores", FilterParams::new().with("search", "shoes"));
        assert_eq!(k.resource(), "stores");
        assert_eq!(k.params().get("search").and_then(FilterValue::as_text), Some("shoes"));
    }
}
