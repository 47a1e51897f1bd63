use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single segment of a [`QueryKey`].
///
/// Segments are either primitives or structured values. Structured maps are ordered by field
/// name, so two parameter sets with the same fields compare equal regardless of the order in
/// which they were built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<KeySegment>),
    Map(BTreeMap<String, KeySegment>),
}

impl KeySegment {
    /// Builds a [`KeySegment::Map`] from `(name, value)` pairs.
    ///
    /// Fields with a `None` value are left out, so an absent optional parameter and an omitted
    /// one address the same cache entry.
    pub fn map<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<KeySegment>)>,
        K: Into<String>,
    {
        let map = fields
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name.into(), value)))
            .collect();
        Self::Map(map)
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u8> for KeySegment {
    fn from(value: u8) -> Self {
        Self::Int(value.into())
    }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
            Self::List(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Self::Map(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{name:?}:{value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// The key that uniquely identifies a cached query result.
///
/// A key is an ordered, immutable list of segments, usually `[entity-kind, params]`. Two keys
/// are equal iff all their segments are equal in order. Cloning a key is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Arc<[KeySegment]>);

impl QueryKey {
    /// Creates a key from a list of segments.
    pub fn from_segments(segments: Vec<KeySegment>) -> Self {
        Self(segments.into())
    }

    /// Returns a new key with `segment` appended.
    pub fn with(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.0.to_vec();
        segments.push(segment.into());
        Self::from_segments(segments)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// Whether the leading segments of this key are equal to all segments of `prefix`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&KeySegment::List(self.0.to_vec()), f)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({self})")
    }
}

/// Builds a [`QueryKey`] from a list of values convertible into [`KeySegment`]s.
///
/// ```
/// use agentquery_service::query_key;
///
/// let key = query_key!["agent", "agent_123", "expanded"];
/// assert_eq!(key.to_string(), r#"["agent","agent_123","expanded"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::caching::QueryKey::from_segments(vec![
            $($crate::caching::KeySegment::from($segment)),*
        ])
    };
}

/// Selects the cache entries affected by an invalidation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyFilter {
    /// Only the entry with exactly this key.
    Exact(QueryKey),
    /// Every entry whose key starts with these segments.
    Prefix(QueryKey),
}

impl KeyFilter {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}
