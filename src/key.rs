use serde::{Deserialize, Serialize};
use std::fmt;

/// Punctuation-free identifier used to group rows and index the snapshot cache.
///
/// `"12.345.678/0001-90"` and `"12345678000190"` normalise to the same key.
/// Only ASCII punctuation and whitespace are removed, so normalising an
/// already-normalised key is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn normalize(raw: &str) -> Self {
        let key = raw
            .chars()
            .filter(|c| !c.is_ascii_punctuation() && !c.is_whitespace())
            .collect();
        EntityKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_and_bare_identifiers_share_a_key() {
        let a = EntityKey::normalize("12.345.678/0001-90");
        let b = EntityKey::normalize("12345678000190");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "12345678000190");
    }

    #[test]
    fn normalisation_is_idempotent() {
        for raw in ["12.345.678/0001-90", " 00.000.000/0001-91 ", "abc-DEF", ""] {
            let once = EntityKey::normalize(raw);
            let twice = EntityKey::normalize(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn distinct_digits_stay_distinct() {
        assert_ne!(
            EntityKey::normalize("12.345.678/0001-90"),
            EntityKey::normalize("12.345.678/0001-91")
        );
    }
}
