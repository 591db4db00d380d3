//! Wrapper for values that must never reach logs or exported output.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

const REDACTED: &str = "[secret]";

/// A value withheld from every default formatting path.
///
/// `Debug`, `Display` and `Serialize` all emit a placeholder. The wrapped
/// value is only reachable through [`Sensitive::expose`] or by composing a
/// new sensitive value with [`Sensitive::map`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Derive a new sensitive value; the result stays wrapped.
    pub fn map<U, F>(&self, f: F) -> Sensitive<U>
    where
        F: FnOnce(&T) -> U,
    {
        Sensitive(f(&self.0))
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sensitive({})", REDACTED)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Sensitive)
    }
}

// Only digests are ever derived from this, never the value itself.
impl<T: Hash> Hash for Sensitive<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_and_display_redact() {
        let secret = Sensitive::new("hunter2".to_string());
        assert_eq!(format!("{}", secret), "[secret]");
        assert_eq!(format!("{:?}", secret), "Sensitive([secret])");
        assert!(!format!("{:#?}", secret).contains("hunter2"));
    }

    #[test]
    fn test_serialize_redacts() {
        let secret = Sensitive::new("hunter2".to_string());
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"[secret]\"");
    }

    #[test]
    fn test_deserialize_wraps_value() {
        let secret: Sensitive<String> = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_expose_and_map() {
        let secret = Sensitive::new("hunter2".to_string());
        assert_eq!(secret.expose(), "hunter2");

        let composed = secret.map(|password| format!("user:{}@host", password));
        assert_eq!(composed.expose(), "user:hunter2@host");
        assert_eq!(composed.to_string(), "[secret]");
        assert_eq!(composed.into_inner(), "user:hunter2@host");
    }

    #[test]
    fn test_nested_debug_redacts() {
        #[derive(Debug)]
        struct Holder {
            #[allow(dead_code)]
            password: Sensitive<String>,
        }

        let holder = Holder {
            password: Sensitive::new("hunter2".to_string()),
        };
        assert!(!format!("{:?}", holder).contains("hunter2"));
    }
}
