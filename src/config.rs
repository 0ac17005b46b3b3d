use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Query parameters that take part in the cache key and are forwarded upstream.
/// Their values are opaque to the proxy.
pub const RECOGNIZED_PARAMS: [&str; 4] = ["w", "h", "q", "f"];

/// Image MIME types that may be served from, or written into, the cache.
pub const IMAGE_CONTENT_TYPES: [&str; 6] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/avif",
    "image/svg+xml",
];

pub const DEFAULT_PATH_PREFIXES: [&str; 2] = ["/assets/", "/images/"];
pub const DEFAULT_CACHE_PREFIX: &str = "image-cache/";
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 8080;

/// Returns true when `value` parses as a MIME type whose essence is in
/// [`IMAGE_CONTENT_TYPES`]. Parameters such as `charset` are ignored.
pub fn is_image_content_type(value: &str) -> bool {
    match value.trim().parse::<mime::Mime>() {
        Ok(m) => {
            let essence = m.essence_str().to_ascii_lowercase();
            IMAGE_CONTENT_TYPES.contains(&essence.as_str())
        }
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Sled,
    Memory,
}

impl std::fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackend::Sled => write!(f, "sled"),
            CacheBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sled" => Ok(CacheBackend::Sled),
            "memory" => Ok(CacheBackend::Memory),
            _ => Err(ConfigError::InvalidBackend(s.to_string())),
        }
    }
}

/// Process-wide proxy settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub upstream_origin: Url,
    pub allowed_path_prefixes: Vec<String>,
    pub cache_prefix: String,
    pub cache_backend: CacheBackend,
    pub cache_dir: PathBuf,
    pub max_cache_object_size: usize, // bytes
    pub port: u16,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("UPSTREAM_ORIGIN must be set")]
    MissingOrigin,
    #[error("Invalid upstream origin: {0}")]
    InvalidOrigin(String),
    #[error("Upstream origin must use https")]
    InsecureOrigin,
    #[error("Upstream origin must not carry a path, query or fragment")]
    OriginHasPath,
    #[error("At least one allowed path prefix is required")]
    NoPathPrefixes,
    #[error("Invalid path prefix: {0:?}")]
    InvalidPathPrefix(String),
    #[error("Cache prefix cannot be empty")]
    EmptyCachePrefix,
    #[error("Unknown cache backend: {0}")]
    InvalidBackend(String),
    #[error("Max cache object size must be > 0")]
    InvalidMaxObjectSize,
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl ProxyConfig {
    /// Configuration for `upstream_origin` with every other field defaulted.
    pub fn new(upstream_origin: Url) -> Self {
        Self {
            upstream_origin,
            allowed_path_prefixes: DEFAULT_PATH_PREFIXES.iter().map(|p| p.to_string()).collect(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            cache_backend: CacheBackend::Sled,
            cache_dir: PathBuf::from("./cache"),
            max_cache_object_size: DEFAULT_MAX_OBJECT_SIZE,
            port: DEFAULT_PORT,
        }
    }

    /// Load configuration from process environment variables.
    ///
    /// - `UPSTREAM_ORIGIN` (required): e.g. `https://images.example.com`
    /// - `ALLOWED_PATH_PREFIXES`: comma separated, default `/assets/,/images/`
    /// - `CACHE_PREFIX`: object store namespace, default `image-cache/`
    /// - `CACHE_BACKEND`: `sled` or `memory`, default `sled`
    /// - `CACHE_DIR`: sled database directory, default `./cache`
    /// - `MAX_CACHE_OBJECT_SIZE`: largest body written back, in bytes
    /// - `PORT`: listen port, default 8080
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origin = lookup("UPSTREAM_ORIGIN").ok_or(ConfigError::MissingOrigin)?;
        let origin =
            Url::parse(origin.trim()).map_err(|e| ConfigError::InvalidOrigin(e.to_string()))?;
        let mut cfg = Self::new(origin);

        if let Some(raw) = lookup("ALLOWED_PATH_PREFIXES") {
            cfg.allowed_path_prefixes = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(prefix) = lookup("CACHE_PREFIX") {
            cfg.cache_prefix = prefix;
        }
        if let Some(backend) = lookup("CACHE_BACKEND") {
            cfg.cache_backend = backend.parse()?;
        }
        if let Some(dir) = lookup("CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("MAX_CACHE_OBJECT_SIZE") {
            cfg.max_cache_object_size = size
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue("MAX_CACHE_OBJECT_SIZE", size.clone()))?;
        }
        if let Some(port) = lookup("PORT") {
            cfg.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PORT", port.clone()))?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = &self.upstream_origin;
        if origin.scheme() != "https" {
            return Err(ConfigError::InsecureOrigin);
        }
        if origin.host_str().is_none() {
            return Err(ConfigError::InvalidOrigin(origin.to_string()));
        }
        if origin.path() != "/" || origin.query().is_some() || origin.fragment().is_some() {
            return Err(ConfigError::OriginHasPath);
        }
        if self.allowed_path_prefixes.is_empty() {
            return Err(ConfigError::NoPathPrefixes);
        }
        if let Some(bad) = self.allowed_path_prefixes.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::InvalidPathPrefix(bad.clone()));
        }
        if self.cache_prefix.is_empty() {
            return Err(ConfigError::EmptyCachePrefix);
        }
        if self.max_cache_object_size == 0 {
            return Err(ConfigError::InvalidMaxObjectSize);
        }
        Ok(())
    }
}
