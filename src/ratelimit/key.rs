//! Counter key generation and handling.

/// A key that uniquely identifies one rate limit counter.
///
/// The key is composed of the caller identity, the HTTP method and the
/// normalized path, so two requests share a counter only when they come
/// from the same caller and hit the same endpoint template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    /// Opaque caller identity
    pub caller_id: String,
    /// HTTP method as received
    pub method: String,
    /// Path after normalization
    pub path: String,
}

impl CompositeKey {
    /// Create a new key. `normalized_path` must already be normalized.
    pub fn new(caller_id: &str, method: &str, normalized_path: &str) -> Self {
        Self {
            caller_id: caller_id.to_string(),
            method: method.to_string(),
            path: normalized_path.to_string(),
        }
    }

    /// The endpoint part of the key, `METHOD:/path`.
    ///
    /// This is the string rules are matched against and the one reported
    /// back to rejected callers.
    pub fn endpoint(&self) -> String {
        endpoint(&self.method, &self.path)
    }
}

/// Join a method and a normalized path into `METHOD:/path`.
pub fn endpoint(method: &str, normalized_path: &str) -> String {
    format!("{}:{}", method, normalized_path)
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}:{}", self.caller_id, self.method, self.path)
    }
}
