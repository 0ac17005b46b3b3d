use crate::config::RECOGNIZED_PARAMS;
use std::collections::BTreeMap;
use std::fmt;

/// Recognized query parameters of one request, ordered by name.
///
/// Values are carried over verbatim (after percent-decoding) and never
/// interpreted. Unrecognized parameters are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedParams(BTreeMap<String, String>);

impl NormalizedParams {
    /// Extract recognized parameters from a raw query string.
    /// When a name repeats, the first occurrence wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let pairs: Vec<(String, String)> = query
            .and_then(|q| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default();

        let mut params = BTreeMap::new();
        for name in RECOGNIZED_PARAMS {
            if let Some((_, value)) = pairs.iter().find(|(k, _)| k == name) {
                params.insert(name.to_string(), value.clone());
            }
        }
        Self(params)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Form-urlencoded serialization in name order. Empty when no
    /// recognized parameter was present.
    pub fn to_query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish()
    }
}

/// Canonical identifier of a cached image: request path (without its
/// leading `/`) plus the sorted recognized parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(path: &str, params: &NormalizedParams) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);
        let query = params.to_query_string();
        if query.is_empty() {
            Self(path.to_string())
        } else {
            Self(format!("{}?{}", path, query))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
