//! Client identity used as the bucket map key.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

/// A key that identifies one rate-limited client.
///
/// The identifier is immutable; the last-activity timestamp is mutable through
/// a shared reference so the limiter can re-stamp a key that is already stored
/// in the bucket map.
///
/// Equality and hashing consider the identifier only. The timestamp is
/// auxiliary state and must stay out of both, otherwise re-stamping a stored
/// key would corrupt the map.
///
/// An empty identifier is the invalid key. It can be constructed freely, but
/// the limiter refuses to store it.
#[derive(Debug)]
pub struct ClientKey {
    identifier: Arc<str>,
    last_activity: Mutex<Instant>,
}

impl ClientKey {
    /// Create a key stamped with the current system time.
    pub fn new(identifier: impl AsRef<str>) -> Self {
        Self::at(identifier, Instant::now())
    }

    /// Create a key stamped with an explicit instant.
    pub fn at(identifier: impl AsRef<str>, last_activity: Instant) -> Self {
        Self {
            identifier: Arc::from(identifier.as_ref()),
            last_activity: Mutex::new(last_activity),
        }
    }

    /// Create a key from an optional identifier. `None` yields the invalid key.
    pub fn from_optional(identifier: Option<&str>) -> Self {
        Self::new(identifier.unwrap_or_default())
    }

    /// The invalid key.
    pub fn invalid() -> Self {
        Self::new("")
    }

    /// The client identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether this key may be stored by the limiter.
    pub fn is_valid(&self) -> bool {
        !self.identifier.is_empty()
    }

    /// When this client was last seen.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Record activity at `at`.
    pub fn touch(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }
}

impl Clone for ClientKey {
    fn clone(&self) -> Self {
        Self {
            identifier: Arc::clone(&self.identifier),
            last_activity: Mutex::new(self.last_activity()),
        }
    }
}

impl PartialEq for ClientKey {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for ClientKey {}

impl Hash for ClientKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must match `str`'s hash so lookups through `Borrow<str>` agree.
        self.identifier().hash(state);
    }
}

impl Borrow<str> for ClientKey {
    fn borrow(&self) -> &str {
        self.identifier()
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifier())
    }
}
